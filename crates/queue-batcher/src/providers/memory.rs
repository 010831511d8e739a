//! In-memory queue provider implementation for testing and development.
//!
//! This module provides a working in-memory broker that:
//! - Keeps one FIFO queue per endpoint, created on first use
//! - Holds received messages in flight until they are deleted
//! - Records every remote call so tests can inspect batching behaviour
//! - Supports injected failures and delays per endpoint and operation
//!
//! All connections opened by one [`InMemoryConnector`] share its broker, so
//! messages sent through one connection are visible to every other.
//! Receiving from an empty queue returns immediately instead of waiting out
//! the long-poll.

use crate::client::{QueueConnection, QueueConnector};
use crate::error::{QueueError, ValidationError};
use crate::message::{BatchEntry, MessageId, QueueEndpoint, ReceiptHandle, ReceivedMessage};
use crate::provider::{InMemoryConfig, ProviderType};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Recorded Calls
// ============================================================================

/// Remote operations a connection performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Send,
    SendBatch,
    Receive,
    Delete,
}

/// One call made against the in-memory broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    Send {
        endpoint: QueueEndpoint,
        body: String,
    },
    SendBatch {
        endpoint: QueueEndpoint,
        entries: Vec<BatchEntry>,
    },
    Receive {
        endpoint: QueueEndpoint,
        max_messages: usize,
        wait: Duration,
    },
    Delete {
        endpoint: QueueEndpoint,
        message_id: MessageId,
    },
}

impl RecordedCall {
    pub fn endpoint(&self) -> &QueueEndpoint {
        match self {
            Self::Send { endpoint, .. }
            | Self::SendBatch { endpoint, .. }
            | Self::Receive { endpoint, .. }
            | Self::Delete { endpoint, .. } => endpoint,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Self::Send { .. } => Operation::Send,
            Self::SendBatch { .. } => Operation::SendBatch,
            Self::Receive { .. } => Operation::Receive,
            Self::Delete { .. } => Operation::Delete,
        }
    }
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// Thread-safe storage shared by all connections of one connector
struct Broker {
    queues: HashMap<QueueEndpoint, InMemoryQueue>,
    calls: Vec<RecordedCall>,
    failures: HashSet<(QueueEndpoint, Operation)>,
    delays: HashMap<QueueEndpoint, Duration>,
    deletions: HashMap<MessageId, u32>,
    connections_opened: usize,
    config: InMemoryConfig,
}

impl Broker {
    fn new(config: InMemoryConfig) -> Self {
        Self {
            queues: HashMap::new(),
            calls: Vec::new(),
            failures: HashSet::new(),
            delays: HashMap::new(),
            deletions: HashMap::new(),
            connections_opened: 0,
            config,
        }
    }

    /// Get or create a queue
    fn queue_mut(&mut self, endpoint: &QueueEndpoint) -> &mut InMemoryQueue {
        self.queues.entry(endpoint.clone()).or_default()
    }

    fn check_failure(
        &self,
        endpoint: &QueueEndpoint,
        operation: Operation,
    ) -> Result<(), QueueError> {
        if self.failures.contains(&(endpoint.clone(), operation)) {
            return Err(QueueError::ProviderError {
                provider: ProviderType::InMemory.to_string(),
                code: "InjectedFailure".to_string(),
                message: format!("{:?} against {} was configured to fail", operation, endpoint),
            });
        }
        Ok(())
    }

    fn enqueue(&mut self, endpoint: &QueueEndpoint, bodies: Vec<String>) -> Result<Vec<MessageId>, QueueError> {
        let max_queue_size = self.config.max_queue_size;
        let queue = self.queue_mut(endpoint);
        if queue.messages.len() + bodies.len() > max_queue_size {
            return Err(QueueError::ProviderError {
                provider: ProviderType::InMemory.to_string(),
                code: "QueueFull".to_string(),
                message: format!("{} holds at most {} messages", endpoint, max_queue_size),
            });
        }

        Ok(bodies
            .into_iter()
            .map(|body| {
                let message_id = MessageId::new();
                queue.messages.push_back(StoredMessage {
                    message_id: message_id.clone(),
                    body,
                    delivery_count: 0,
                });
                message_id
            })
            .collect())
    }
}

/// Internal queue state for a single endpoint
#[derive(Default)]
struct InMemoryQueue {
    /// Messages waiting to be received (FIFO order)
    messages: VecDeque<StoredMessage>,
    /// Received messages keyed by receipt, waiting for deletion
    in_flight: HashMap<String, StoredMessage>,
}

/// A message stored in the queue with metadata
#[derive(Clone)]
struct StoredMessage {
    message_id: MessageId,
    body: String,
    delivery_count: u32,
}

// ============================================================================
// InMemoryConnector
// ============================================================================

/// Connector handing out connections to a shared in-memory broker
///
/// Clones share the broker, so a test can keep one clone for inspection while
/// a client owns another.
///
/// ```
/// use queue_batcher::{BatchedQueueClient, BatcherConfig, InMemoryConnector, QueueEndpoint};
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let broker = InMemoryConnector::default();
/// let endpoint = QueueEndpoint::new("orders").unwrap();
/// let client = BatchedQueueClient::connect(
///     Arc::new(broker.clone()),
///     endpoint.clone(),
///     BatcherConfig {
///         receive_wait_seconds: 0,
///         ..BatcherConfig::default()
///     },
/// )
/// .await
/// .unwrap();
///
/// let report = client.send(vec!["a"; 12]).await.unwrap();
/// assert_eq!(report.batch_count(), 2);
/// assert_eq!(broker.available(&endpoint), 12);
/// # });
/// ```
#[derive(Clone)]
pub struct InMemoryConnector {
    broker: Arc<RwLock<Broker>>,
}

impl InMemoryConnector {
    /// Create new in-memory connector with configuration
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            broker: Arc::new(RwLock::new(Broker::new(config))),
        }
    }

    /// Put messages straight onto a queue without recording a call
    pub fn seed<I, S>(&self, endpoint: &QueueEndpoint, bodies: I) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut broker = self.write()?;
        broker.enqueue(endpoint, bodies.into_iter().map(Into::into).collect())?;
        Ok(())
    }

    /// Make every `operation` against `endpoint` fail
    pub fn fail_operation(&self, endpoint: &QueueEndpoint, operation: Operation) {
        if let Ok(mut broker) = self.broker.write() {
            broker.failures.insert((endpoint.clone(), operation));
        }
    }

    /// Stop failing `operation` against `endpoint`
    pub fn clear_failure(&self, endpoint: &QueueEndpoint, operation: Operation) {
        if let Ok(mut broker) = self.broker.write() {
            broker.failures.remove(&(endpoint.clone(), operation));
        }
    }

    /// Delay every call against `endpoint` by `delay`
    pub fn set_delay(&self, endpoint: &QueueEndpoint, delay: Duration) {
        if let Ok(mut broker) = self.broker.write() {
            broker.delays.insert(endpoint.clone(), delay);
        }
    }

    /// All calls made so far, in the order the broker saw them
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.broker
            .read()
            .map(|broker| broker.calls.clone())
            .unwrap_or_default()
    }

    /// Messages waiting to be received on `endpoint`
    pub fn available(&self, endpoint: &QueueEndpoint) -> usize {
        self.broker
            .read()
            .ok()
            .and_then(|broker| broker.queues.get(endpoint).map(|q| q.messages.len()))
            .unwrap_or(0)
    }

    /// Messages received from `endpoint` but not yet deleted
    pub fn in_flight(&self, endpoint: &QueueEndpoint) -> usize {
        self.broker
            .read()
            .ok()
            .and_then(|broker| broker.queues.get(endpoint).map(|q| q.in_flight.len()))
            .unwrap_or(0)
    }

    /// How many times the message was deleted
    pub fn deletion_count(&self, message_id: &MessageId) -> u32 {
        self.broker
            .read()
            .ok()
            .and_then(|broker| broker.deletions.get(message_id).copied())
            .unwrap_or(0)
    }

    /// Connections handed out so far
    pub fn connections_opened(&self) -> usize {
        self.broker
            .read()
            .map(|broker| broker.connections_opened)
            .unwrap_or(0)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Broker>, QueueError> {
        self.broker.write().map_err(|_| lock_poisoned())
    }
}

impl Default for InMemoryConnector {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

#[async_trait]
impl QueueConnector for InMemoryConnector {
    async fn connect(
        &self,
        endpoint: &QueueEndpoint,
    ) -> Result<Arc<dyn QueueConnection>, QueueError> {
        let mut broker = self.write()?;
        broker.connections_opened += 1;

        Ok(Arc::new(InMemoryConnection {
            broker: Arc::clone(&self.broker),
            endpoint: endpoint.clone(),
        }))
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemory
    }
}

// ============================================================================
// InMemoryConnection
// ============================================================================

/// Connection to one endpoint of the in-memory broker
pub struct InMemoryConnection {
    broker: Arc<RwLock<Broker>>,
    endpoint: QueueEndpoint,
}

impl InMemoryConnection {
    /// Record the call, apply injected delay, then check injected failures
    async fn begin(&self, call: RecordedCall) -> Result<(), QueueError> {
        let operation = call.operation();
        let delay = {
            let mut broker = self.broker.write().map_err(|_| lock_poisoned())?;
            broker.calls.push(call);
            broker.delays.get(&self.endpoint).copied()
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let broker = self.broker.read().map_err(|_| lock_poisoned())?;
        broker.check_failure(&self.endpoint, operation)
    }
}

#[async_trait]
impl QueueConnection for InMemoryConnection {
    async fn send_message(&self, body: &str) -> Result<MessageId, QueueError> {
        self.begin(RecordedCall::Send {
            endpoint: self.endpoint.clone(),
            body: body.to_string(),
        })
        .await?;

        let mut broker = self.broker.write().map_err(|_| lock_poisoned())?;
        let mut ids = broker.enqueue(&self.endpoint, vec![body.to_string()])?;
        ids.pop().ok_or_else(|| QueueError::ProviderError {
            provider: ProviderType::InMemory.to_string(),
            code: "EnqueueFailed".to_string(),
            message: "no message id assigned".to_string(),
        })
    }

    async fn send_message_batch(
        &self,
        entries: &[BatchEntry],
    ) -> Result<Vec<MessageId>, QueueError> {
        self.begin(RecordedCall::SendBatch {
            endpoint: self.endpoint.clone(),
            entries: entries.to_vec(),
        })
        .await?;

        if entries.is_empty() {
            return Err(ValidationError::Required {
                field: "entries".to_string(),
            }
            .into());
        }

        let max_size = self.max_batch_size();
        if entries.len() > max_size {
            return Err(QueueError::BatchTooLarge {
                size: entries.len(),
                max_size,
            });
        }

        let distinct: HashSet<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        if distinct.len() != entries.len() {
            return Err(ValidationError::InvalidFormat {
                field: "entries".to_string(),
                message: "batch entry ids must be distinct".to_string(),
            }
            .into());
        }

        let mut broker = self.broker.write().map_err(|_| lock_poisoned())?;
        broker.enqueue(
            &self.endpoint,
            entries.iter().map(|e| e.body.clone()).collect(),
        )
    }

    async fn receive_messages(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        self.begin(RecordedCall::Receive {
            endpoint: self.endpoint.clone(),
            max_messages,
            wait,
        })
        .await?;

        let max_messages = max_messages.min(self.max_batch_size());
        let mut broker = self.broker.write().map_err(|_| lock_poisoned())?;
        let queue = broker.queue_mut(&self.endpoint);

        let mut received = Vec::new();
        while received.len() < max_messages {
            let Some(mut stored) = queue.messages.pop_front() else {
                break;
            };
            stored.delivery_count += 1;

            let receipt = uuid::Uuid::new_v4().to_string();
            received.push(ReceivedMessage {
                message_id: stored.message_id.clone(),
                body: stored.body.clone(),
                receipt_handle: ReceiptHandle::new(
                    receipt.clone(),
                    self.endpoint.clone(),
                    ProviderType::InMemory,
                ),
                delivery_count: stored.delivery_count,
            });
            queue.in_flight.insert(receipt, stored);
        }

        Ok(received)
    }

    async fn delete_message(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        self.begin(RecordedCall::Delete {
            endpoint: self.endpoint.clone(),
            message_id: message.message_id.clone(),
        })
        .await?;

        let receipt = message.receipt_handle.handle();
        let mut broker = self.broker.write().map_err(|_| lock_poisoned())?;
        let removed = broker.queue_mut(&self.endpoint).in_flight.remove(receipt);

        match removed {
            Some(stored) => {
                *broker.deletions.entry(stored.message_id).or_insert(0) += 1;
                Ok(())
            }
            None => Err(QueueError::MessageNotFound {
                receipt: receipt.to_string(),
            }),
        }
    }

    fn endpoint(&self) -> &QueueEndpoint {
        &self.endpoint
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemory
    }
}

fn lock_poisoned() -> QueueError {
    QueueError::ProviderError {
        provider: ProviderType::InMemory.to_string(),
        code: "LockPoisoned".to_string(),
        message: "in-memory broker lock poisoned".to_string(),
    }
}
