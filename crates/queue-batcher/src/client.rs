//! Provider traits and the batching client built on top of them.

use crate::batch::{batch_count, partition, Batch};
use crate::dispatch::{fetch, BatchOutcome, Dispatcher, ReceiveReport, SendReport};
use crate::error::QueueError;
use crate::handle::QueueHandle;
use crate::message::{
    BatchEntry, MessageId, Payload, PayloadItem, QueueEndpoint, ReceivedMessage,
};
use crate::provider::{BatcherConfig, FailurePolicy, ProviderConfig, ProviderType};
use crate::providers::{AwsSqsConnector, InMemoryConnector};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// A live connection to one remote queue
///
/// Implemented by each provider. A connection is bound to a single endpoint
/// for its whole life.
#[async_trait]
pub trait QueueConnection: Send + Sync {
    /// Send one message
    async fn send_message(&self, body: &str) -> Result<MessageId, QueueError>;

    /// Send up to `max_batch_size` messages in one call
    ///
    /// Entry ids must be unique within `entries`. Entries the provider
    /// rejects individually are reported as `PartialBatchFailure`.
    async fn send_message_batch(&self, entries: &[BatchEntry])
        -> Result<Vec<MessageId>, QueueError>;

    /// Long-poll for up to `max_messages` messages, waiting at most `wait`
    async fn receive_messages(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Remove a received message from the queue
    async fn delete_message(&self, message: &ReceivedMessage) -> Result<(), QueueError>;

    /// Endpoint this connection is bound to
    fn endpoint(&self) -> &QueueEndpoint;

    /// Get provider type
    fn provider_type(&self) -> ProviderType;

    /// Get maximum batch size
    fn max_batch_size(&self) -> usize {
        self.provider_type().max_batch_size()
    }
}

/// Opens connections to queue endpoints
#[async_trait]
pub trait QueueConnector: Send + Sync {
    /// Open a new connection bound to `endpoint`
    async fn connect(&self, endpoint: &QueueEndpoint)
        -> Result<Arc<dyn QueueConnection>, QueueError>;

    /// Get provider type
    fn provider_type(&self) -> ProviderType;
}

/// Factory for creating connectors from configuration
pub struct QueueConnectorFactory;

impl QueueConnectorFactory {
    /// Create connector for the configured provider
    pub fn create_connector(
        provider: &ProviderConfig,
    ) -> Result<Arc<dyn QueueConnector>, QueueError> {
        let connector: Arc<dyn QueueConnector> = match provider {
            ProviderConfig::AwsSqs(aws_config) => {
                Arc::new(AwsSqsConnector::new(aws_config.clone()).map_err(|e| e.to_queue_error())?)
            }
            ProviderConfig::InMemory(memory_config) => {
                Arc::new(InMemoryConnector::new(memory_config.clone()))
            }
        };

        Ok(connector)
    }
}

/// Client that splits send and receive workloads into provider-sized batches
///
/// Small workloads go straight through the handle's connection. Larger ones
/// are partitioned and run as concurrent dispatch units, each with its own
/// connection, and joined before the call returns.
pub struct BatchedQueueClient {
    handle: QueueHandle,
    config: BatcherConfig,
    permits: Arc<Semaphore>,
}

impl BatchedQueueClient {
    /// Create client around an existing handle
    pub fn new(handle: QueueHandle, config: BatcherConfig) -> Result<Self, QueueError> {
        config.validate()?;
        let permits = Arc::new(Semaphore::new(config.max_concurrent_units));
        Ok(Self {
            handle,
            config,
            permits,
        })
    }

    /// Connect to `endpoint` through `connector` and wrap the handle
    pub async fn connect(
        connector: Arc<dyn QueueConnector>,
        endpoint: QueueEndpoint,
        config: BatcherConfig,
    ) -> Result<Self, QueueError> {
        let handle = QueueHandle::connect(connector, endpoint).await?;
        Self::new(handle, config)
    }

    /// Create client for the provider named in the configuration
    pub async fn from_config(
        config: BatcherConfig,
        endpoint: QueueEndpoint,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        let connector = QueueConnectorFactory::create_connector(&config.provider)?;
        Self::connect(connector, endpoint, config).await
    }

    /// Endpoint all operations currently target
    pub fn endpoint(&self) -> &QueueEndpoint {
        self.handle.endpoint()
    }

    pub fn handle(&self) -> &QueueHandle {
        &self.handle
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }

    /// Point the client at another queue
    ///
    /// The endpoint and its connection are replaced together; if connecting
    /// fails the client keeps its current handle.
    pub async fn set_endpoint(&mut self, endpoint: QueueEndpoint) -> Result<(), QueueError> {
        let handle = self.handle.reconnect(endpoint).await?;
        info!(
            from = %self.handle.endpoint(),
            to = %handle.endpoint(),
            "Switched queue endpoint"
        );
        self.handle = handle;
        Ok(())
    }

    /// Messages per batch call for the current connection
    pub fn batch_size(&self) -> usize {
        self.config
            .max_batch_size
            .min(self.handle.connection().max_batch_size())
    }

    /// Send a text, a record, or a list of either
    ///
    /// Lists longer than [`batch_size`](Self::batch_size) are partitioned and
    /// every batch is sent by its own dispatch unit. The report holds one
    /// outcome per batch; how failures surface depends on the configured
    /// [`FailurePolicy`].
    pub async fn send(&self, payload: impl Into<Payload>) -> Result<SendReport, QueueError> {
        let payload = payload.into();
        let batch_size = self.batch_size();

        match payload {
            Payload::Text(text) => self.send_single(text).await,
            Payload::Record(record) => {
                let body = PayloadItem::Record(record).to_body()?;
                self.send_single(body).await
            }
            Payload::Batch(items) if items.is_empty() => Ok(SendReport::default()),
            Payload::Batch(items) if items.len() <= batch_size => {
                let batch = Batch::new(0, &items, batch_size)?;
                self.check_batch_sizes([&batch])?;
                self.send_direct(batch).await
            }
            Payload::Batch(items) => {
                let batches = partition(&items, batch_size)?;
                self.check_batch_sizes(&batches)?;

                let report = self.dispatcher().send_batches(batches).await?;
                info!(
                    endpoint = %self.endpoint(),
                    batches = report.batch_count(),
                    sent = report.sent_count(),
                    failed_batches = report.failures().count(),
                    "Dispatched batched send"
                );
                Ok(report)
            }
        }
    }

    /// Receive roughly `count` messages
    ///
    /// Each fetch asks for a full batch, so up to `batch_size` messages come
    /// back for any `count` that fits one batch and up to
    /// `ceil(count / batch_size) * batch_size` otherwise. Fewer arrive when the
    /// queue runs dry. With the default eager delete policy every returned
    /// message has already been removed from the queue.
    pub async fn receive(&self, count: usize) -> Result<ReceiveReport, QueueError> {
        if count == 0 {
            return Ok(ReceiveReport::default());
        }

        let batch_size = self.batch_size();
        let wait = self.config.receive_wait();

        if count <= batch_size {
            let result = self
                .bounded(fetch(
                    self.handle.connection().as_ref(),
                    batch_size,
                    wait,
                    self.config.delete_policy,
                ))
                .await;

            return match result {
                Ok(messages) => {
                    debug!(
                        endpoint = %self.endpoint(),
                        received = messages.len(),
                        "Received single batch"
                    );
                    Ok(ReceiveReport::from_messages(messages))
                }
                Err(error) => self.settle_receive_failure(error),
            };
        }

        let units = batch_count(count, batch_size);
        let report = self
            .dispatcher()
            .receive_units(units, batch_size, wait, self.config.delete_policy)
            .await?;
        info!(
            endpoint = %self.endpoint(),
            requested = count,
            units,
            received = report.len(),
            failed_units = report.failures().len(),
            "Dispatched batched receive"
        );
        Ok(report)
    }

    /// Receive with the default count of one batch
    pub async fn receive_default(&self) -> Result<ReceiveReport, QueueError> {
        self.receive(self.batch_size()).await
    }

    /// Delete messages that were received under the deferred delete policy
    ///
    /// Messages are deleted against the endpoint that issued their receipt,
    /// even if the client has since moved to another endpoint. Stops at the
    /// first failure.
    pub async fn acknowledge(&self, messages: &[ReceivedMessage]) -> Result<usize, QueueError> {
        let mut connections: HashMap<QueueEndpoint, Arc<dyn QueueConnection>> = HashMap::new();
        connections.insert(
            self.endpoint().clone(),
            Arc::clone(self.handle.connection()),
        );

        for message in messages {
            let endpoint = message.receipt_handle.endpoint();
            let connection = match connections.get(endpoint) {
                Some(connection) => Arc::clone(connection),
                None => {
                    let connection = self.handle.connector().connect(endpoint).await?;
                    connections.insert(endpoint.clone(), Arc::clone(&connection));
                    connection
                }
            };
            connection.delete_message(message).await?;
        }

        debug!(acknowledged = messages.len(), "Acknowledged messages");
        Ok(messages.len())
    }

    async fn send_single(&self, body: String) -> Result<SendReport, QueueError> {
        self.check_sizes([body.as_str()])?;

        let result = self
            .bounded(self.handle.connection().send_message(&body))
            .await
            .map(|id| vec![id]);
        self.settle_send(BatchOutcome {
            index: 0,
            entry_count: 1,
            result,
        })
    }

    async fn send_direct(&self, batch: Batch) -> Result<SendReport, QueueError> {
        let result = self
            .bounded(self.handle.connection().send_message_batch(batch.entries()))
            .await;
        self.settle_send(BatchOutcome {
            index: batch.index(),
            entry_count: batch.len(),
            result,
        })
    }

    fn settle_send(&self, outcome: BatchOutcome) -> Result<SendReport, QueueError> {
        let BatchOutcome {
            index,
            entry_count,
            result,
        } = outcome;

        match result {
            Err(error) if self.config.failure_policy == FailurePolicy::FailFast => Err(error),
            result => {
                if let Err(error) = &result {
                    warn!(
                        endpoint = %self.endpoint(),
                        entries = entry_count,
                        error = %error,
                        "Send failed"
                    );
                }
                Ok(SendReport::from_outcomes(vec![BatchOutcome {
                    index,
                    entry_count,
                    result,
                }]))
            }
        }
    }

    fn settle_receive_failure(&self, error: QueueError) -> Result<ReceiveReport, QueueError> {
        if self.config.failure_policy == FailurePolicy::FailFast {
            return Err(error);
        }

        warn!(endpoint = %self.endpoint(), error = %error, "Receive failed");
        let (received, error) = error.into_received();
        Ok(ReceiveReport::from_failure(received, 0, error))
    }

    /// Apply the unit timeout to a call made on the handle's connection
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, QueueError>>,
    ) -> Result<T, QueueError> {
        match self.config.unit_timeout() {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| QueueError::Timeout { duration: limit })?,
            None => call.await,
        }
    }

    fn check_sizes<'a>(&self, bodies: impl IntoIterator<Item = &'a str>) -> Result<(), QueueError> {
        let max_size = self.handle.connection().provider_type().max_message_size();
        match bodies.into_iter().find(|body| body.len() > max_size) {
            Some(body) => Err(QueueError::MessageTooLarge {
                size: body.len(),
                max_size,
            }),
            None => Ok(()),
        }
    }

    /// Check every body and the combined size of each batch request
    fn check_batch_sizes<'a>(
        &self,
        batches: impl IntoIterator<Item = &'a Batch>,
    ) -> Result<(), QueueError> {
        let max_size = self
            .handle
            .connection()
            .provider_type()
            .max_batch_payload_size();

        for batch in batches {
            self.check_sizes(batch.entries().iter().map(|e| e.body.as_str()))?;

            let size: usize = batch.entries().iter().map(|e| e.body.len()).sum();
            if size > max_size {
                return Err(QueueError::BatchPayloadTooLarge {
                    index: batch.index(),
                    size,
                    max_size,
                });
            }
        }
        Ok(())
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            Arc::clone(self.handle.connector()),
            self.endpoint().clone(),
            Arc::clone(&self.permits),
            self.config.unit_timeout(),
            self.config.failure_policy,
        )
    }
}

impl std::fmt::Debug for BatchedQueueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchedQueueClient")
            .field("handle", &self.handle)
            .field("batch_size", &self.batch_size())
            .field("failure_policy", &self.config.failure_policy)
            .field("delete_policy", &self.config.delete_policy)
            .finish()
    }
}
