//! Concurrent dispatch of batches and aggregation of their results.
//!
//! Every batch runs as its own dispatch unit: a spawned task that opens its
//! own connection, performs one remote call sequence and finishes. Units
//! share nothing but a semaphore that caps how many talk to the queue at
//! once. The caller joins all units in launch order; receive units hand their
//! messages back over a private one-shot channel that is read once after the
//! join.

use crate::batch::Batch;
use crate::client::{QueueConnection, QueueConnector};
use crate::error::QueueError;
use crate::message::{MessageId, QueueEndpoint, ReceivedMessage};
use crate::provider::{DeletePolicy, FailurePolicy};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;

// ============================================================================
// Result Types
// ============================================================================

/// Result of sending one batch
#[derive(Debug)]
pub struct BatchOutcome {
    /// Position of the batch within the partitioned payload
    pub index: usize,
    pub entry_count: usize,
    pub result: Result<Vec<MessageId>, QueueError>,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Message ids the queue accepted, including those of a partial failure
    pub fn accepted_ids(&self) -> &[MessageId] {
        match &self.result {
            Ok(ids) => ids,
            Err(QueueError::PartialBatchFailure { succeeded, .. }) => succeeded,
            Err(_) => &[],
        }
    }
}

/// Per-batch outcomes of a send, ordered by batch index
#[derive(Debug, Default)]
pub struct SendReport {
    outcomes: Vec<BatchOutcome>,
}

impl SendReport {
    pub(crate) fn from_outcomes(outcomes: Vec<BatchOutcome>) -> Self {
        Self { outcomes }
    }

    pub fn outcomes(&self) -> &[BatchOutcome] {
        &self.outcomes
    }

    /// Number of provider calls the send was split into
    pub fn batch_count(&self) -> usize {
        self.outcomes.len()
    }

    /// Messages the queue accepted, counting accepted entries of partly failed batches
    pub fn sent_count(&self) -> usize {
        self.outcomes.iter().map(|o| o.accepted_ids().len()).sum()
    }

    /// Batches whose call failed
    pub fn failures(&self) -> impl Iterator<Item = &BatchOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    /// Check if every batch was accepted
    pub fn is_complete_success(&self) -> bool {
        self.outcomes.iter().all(BatchOutcome::is_success)
    }

    /// Provider message ids of all accepted messages
    pub fn message_ids(&self) -> impl Iterator<Item = &MessageId> {
        self.outcomes.iter().flat_map(BatchOutcome::accepted_ids)
    }
}

/// A receive unit that did not deliver messages
#[derive(Debug)]
pub struct UnitFailure {
    pub unit: usize,
    pub error: QueueError,
}

/// Messages gathered by a receive, flattened in unit launch order
#[derive(Debug, Default)]
pub struct ReceiveReport {
    messages: Vec<ReceivedMessage>,
    failures: Vec<UnitFailure>,
}

impl ReceiveReport {
    pub(crate) fn from_messages(messages: Vec<ReceivedMessage>) -> Self {
        Self {
            messages,
            failures: Vec::new(),
        }
    }

    pub(crate) fn from_failure(
        messages: Vec<ReceivedMessage>,
        unit: usize,
        error: QueueError,
    ) -> Self {
        Self {
            messages,
            failures: vec![UnitFailure { unit, error }],
        }
    }

    pub fn messages(&self) -> &[ReceivedMessage] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<ReceivedMessage> {
        self.messages
    }

    /// Message bodies in order
    pub fn bodies(&self) -> Vec<&str> {
        self.messages.iter().map(|m| m.body.as_str()).collect()
    }

    pub fn into_bodies(self) -> Vec<String> {
        self.messages.into_iter().map(|m| m.body).collect()
    }

    pub fn failures(&self) -> &[UnitFailure] {
        &self.failures
    }

    pub fn is_complete_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Fetch one batch of messages and, under the eager policy, delete them
///
/// Every fetched message is deleted before this returns, so under
/// [`DeletePolicy::Eager`] the returned list is the only remaining copy. A
/// failed delete fails the fetch; messages deleted before it travel in
/// [`QueueError::ReceiveAborted`] and the rest stay on the queue.
pub(crate) async fn fetch(
    connection: &dyn QueueConnection,
    max_messages: usize,
    wait: Duration,
    delete_policy: DeletePolicy,
) -> Result<Vec<ReceivedMessage>, QueueError> {
    let mut messages = connection.receive_messages(max_messages, wait).await?;

    if delete_policy == DeletePolicy::Eager {
        let mut deleted = 0;
        while deleted < messages.len() {
            if let Err(error) = connection.delete_message(&messages[deleted]).await {
                messages.truncate(deleted);
                return Err(QueueError::receive_aborted(messages, error));
            }
            deleted += 1;
        }
    }

    Ok(messages)
}

/// Runs batches as concurrent dispatch units against one endpoint
pub(crate) struct Dispatcher {
    connector: Arc<dyn QueueConnector>,
    endpoint: QueueEndpoint,
    permits: Arc<Semaphore>,
    unit_timeout: Option<Duration>,
    failure_policy: FailurePolicy,
}

impl Dispatcher {
    pub(crate) fn new(
        connector: Arc<dyn QueueConnector>,
        endpoint: QueueEndpoint,
        permits: Arc<Semaphore>,
        unit_timeout: Option<Duration>,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            connector,
            endpoint,
            permits,
            unit_timeout,
            failure_policy,
        }
    }

    /// Send every batch from its own unit and wait for all of them
    pub(crate) async fn send_batches(&self, batches: Vec<Batch>) -> Result<SendReport, QueueError> {
        let mut shapes = Vec::with_capacity(batches.len());
        let mut handles = Vec::with_capacity(batches.len());

        for batch in batches {
            shapes.push((batch.index(), batch.len()));
            handles.push(self.spawn_unit(batch.index(), move |connection| async move {
                connection.send_message_batch(batch.entries()).await
            }));
        }

        let results = self.join_units(handles).await?;
        let outcomes = shapes
            .into_iter()
            .zip(results)
            .map(|((index, entry_count), result)| {
                if let Err(error) = &result {
                    warn!(
                        batch = index,
                        entries = entry_count,
                        error = %error,
                        "Batch send failed"
                    );
                }
                BatchOutcome {
                    index,
                    entry_count,
                    result,
                }
            })
            .collect();

        Ok(SendReport::from_outcomes(outcomes))
    }

    /// Run `units` fetch units and flatten their messages in launch order
    ///
    /// A unit hands back every message it removed from the queue, even when
    /// it fails part way. Under [`FailurePolicy::FailFast`] messages already
    /// handed back are returned inside [`QueueError::ReceiveAborted`].
    pub(crate) async fn receive_units(
        &self,
        units: usize,
        max_messages: usize,
        wait: Duration,
        delete_policy: DeletePolicy,
    ) -> Result<ReceiveReport, QueueError> {
        let mut channels = Vec::with_capacity(units);
        let mut handles = Vec::with_capacity(units);

        for unit in 0..units {
            let (sender, receiver) = oneshot::channel();
            channels.push(receiver);
            handles.push(self.spawn_unit(unit, move |connection| async move {
                let result = fetch(connection.as_ref(), max_messages, wait, delete_policy).await;
                let (messages, error) = match result {
                    Ok(messages) => (messages, None),
                    Err(error) => {
                        let (received, source) = error.into_received();
                        (received, Some(source))
                    }
                };

                let delivered = sender.send(messages).map_err(|_| QueueError::DispatchFailed {
                    unit,
                    message: "result channel closed".to_string(),
                });
                match error {
                    Some(error) => Err(error),
                    None => delivered,
                }
            }));
        }

        // Every unit has stopped once the join returns, so the channels hold
        // all messages that were handed back
        let results = match self.join_units(handles).await {
            Ok(results) => results,
            Err(error) => {
                let received = channels
                    .into_iter()
                    .filter_map(|mut receiver| receiver.try_recv().ok())
                    .flatten()
                    .collect();
                return Err(QueueError::receive_aborted(received, error));
            }
        };

        let mut report = ReceiveReport::default();
        for (unit, (result, mut receiver)) in results.into_iter().zip(channels).enumerate() {
            let delivered = receiver.try_recv().ok();

            let error = match (result, delivered) {
                (Ok(()), Some(messages)) => {
                    report.messages.extend(messages);
                    continue;
                }
                (Ok(()), None) => QueueError::DispatchFailed {
                    unit,
                    message: "unit finished without sending its messages".to_string(),
                },
                (Err(error), delivered) => {
                    report.messages.extend(delivered.into_iter().flatten());
                    error
                }
            };

            warn!(unit, error = %error, "Receive unit failed");
            report.failures.push(UnitFailure { unit, error });
        }

        Ok(report)
    }

    fn spawn_unit<T, F, Fut>(&self, unit: usize, work: F) -> JoinHandle<Result<T, QueueError>>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn QueueConnection>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, QueueError>> + Send + 'static,
    {
        let connector = Arc::clone(&self.connector);
        let endpoint = self.endpoint.clone();
        let permits = Arc::clone(&self.permits);
        let unit_timeout = self.unit_timeout;

        tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| QueueError::DispatchFailed {
                    unit,
                    message: "dispatcher shut down".to_string(),
                })?;
            debug!(unit, endpoint = %endpoint, "Dispatch unit started");

            let run = async {
                let connection = connector.connect(&endpoint).await?;
                work(connection).await
            };

            match unit_timeout {
                Some(limit) => tokio::time::timeout(limit, run)
                    .await
                    .map_err(|_| QueueError::Timeout { duration: limit })?,
                None => run.await,
            }
        })
    }

    /// Wait for every unit in launch order
    ///
    /// Under [`FailurePolicy::FailFast`] the first failure aborts the units
    /// not yet joined and is returned as the error once they have stopped.
    async fn join_units<T>(
        &self,
        handles: Vec<JoinHandle<Result<T, QueueError>>>,
    ) -> Result<Vec<Result<T, QueueError>>, QueueError> {
        let mut results = Vec::with_capacity(handles.len());
        let mut pending = handles.into_iter().enumerate();

        while let Some((unit, handle)) = pending.next() {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_error) => {
                    error!(unit, error = %join_error, "Dispatch unit did not complete");
                    Err(QueueError::DispatchFailed {
                        unit,
                        message: join_error.to_string(),
                    })
                }
            };

            match result {
                Err(error) if self.failure_policy == FailurePolicy::FailFast => {
                    let remaining: Vec<_> = pending.map(|(_, handle)| handle).collect();
                    let aborted = remaining.len();
                    for handle in &remaining {
                        handle.abort();
                    }
                    for handle in remaining {
                        // Finished or cancelled, either way the unit has stopped
                        let _ = handle.await;
                    }
                    warn!(
                        unit,
                        aborted,
                        error = %error,
                        "Dispatch unit failed, aborting remaining units"
                    );
                    return Err(error);
                }
                result => results.push(result),
            }
        }

        Ok(results)
    }
}
