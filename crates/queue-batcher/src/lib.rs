//! # Queue Batcher
//!
//! Batching client layer for remote message queues with support for AWS SQS
//! and an in-memory broker.
//!
//! This library provides:
//! - Sending text, records, or lists of either through one entry point
//! - Splitting lists into provider-sized batches with batch-local entry ids
//! - Concurrent dispatch of batches, one connection per dispatch unit
//! - Receiving more messages than one call returns, with delete-on-receive
//! - Switching the target queue between operations
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all queue operations
//! - [`message`] - Payloads, endpoints and received messages
//! - [`provider`] - Provider types and configuration
//! - [`batch`] - Partitioning of payload lists into batches
//! - [`handle`] - Endpoint to connection binding
//! - [`dispatch`] - Concurrent dispatch units and their reports
//! - [`client`] - Provider traits and the batching client
//! - [`providers`] - AWS SQS and in-memory implementations
//!
//! ## Example
//!
//! ```no_run
//! use queue_batcher::{BatchedQueueClient, BatcherConfig, QueueEndpoint};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BatcherConfig::load(None)?;
//! let endpoint = QueueEndpoint::new("orders")?;
//! let client = BatchedQueueClient::from_config(config, endpoint).await?;
//!
//! client.send("hello").await?;
//! client.send(vec!["a", "b", "c"]).await?;
//! client.send(queue_batcher::Payload::from_json(json!({"k": "v"}))?).await?;
//!
//! let received = client.receive(25).await?;
//! for body in received.bodies() {
//!     println!("{}", body);
//! }
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod client;
pub mod dispatch;
pub mod error;
pub mod handle;
pub mod message;
pub mod provider;
pub mod providers;

// Re-export commonly used types at crate root for convenience
pub use batch::{batch_count, partition, Batch};
pub use client::{BatchedQueueClient, QueueConnection, QueueConnector, QueueConnectorFactory};
pub use dispatch::{BatchOutcome, ReceiveReport, SendReport, UnitFailure};
pub use error::{ConfigurationError, QueueError, SerializationError, ValidationError};
pub use handle::QueueHandle;
pub use message::{
    BatchEntry, MessageId, Payload, PayloadItem, QueueEndpoint, ReceiptHandle, ReceivedMessage,
};
pub use provider::{
    AwsSqsConfig, BatcherConfig, DeletePolicy, FailurePolicy, InMemoryConfig, ProviderConfig,
    ProviderType, SQS_MAX_BATCH_SIZE,
};
pub use providers::{AwsSqsConnector, InMemoryConnector};
