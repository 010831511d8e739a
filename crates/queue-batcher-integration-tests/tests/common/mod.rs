//! Common test utilities for queue-batcher integration tests
//!
//! This module provides:
//! - Tracing setup controlled by `RUST_LOG`
//! - Helpers for building clients against a shared in-memory broker

use queue_batcher::{BatchedQueueClient, BatcherConfig, InMemoryConnector, QueueEndpoint};
use std::sync::{Arc, Once};

static TRACING: Once = Once::new();

/// Install a test subscriber once per test binary
#[allow(dead_code)]
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "queue_batcher=warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

#[allow(dead_code)]
pub fn endpoint(name: &str) -> QueueEndpoint {
    QueueEndpoint::new(name).expect("test endpoint names are valid")
}

/// Connect a client to `queue` through `broker`
#[allow(dead_code)]
pub async fn connect(
    broker: &InMemoryConnector,
    queue: &str,
    config: BatcherConfig,
) -> BatchedQueueClient {
    init_tracing();
    BatchedQueueClient::connect(Arc::new(broker.clone()), endpoint(queue), config)
        .await
        .expect("in-memory connect succeeds")
}

/// Bodies `prefix0..prefix{count}`
#[allow(dead_code)]
pub fn numbered(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{}{}", prefix, i)).collect()
}
