//! Error types for batching queue operations.

use crate::message::{MessageId, ReceivedMessage};
use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all batching queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Unsupported payload type: {found} (must be text, a record, or a list of either)")]
    InvalidPayloadType { found: String },

    #[error("Queue not found: {endpoint}")]
    QueueNotFound { endpoint: String },

    #[error("Message not found or receipt expired: {receipt}")]
    MessageNotFound { receipt: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    /// Some entries of a batch were rejected; the rest are already queued
    #[error("{} batch entries failed ({} succeeded): {failed:?}", .failed.len(), .succeeded.len())]
    PartialBatchFailure {
        failed: Vec<String>,
        /// Message ids of the accepted entries, in entry order
        succeeded: Vec<MessageId>,
    },

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Batch size {size} exceeds maximum {max_size}")]
    BatchTooLarge { size: usize, max_size: usize },

    #[error("Batch {index} carries {size} bytes of bodies (max: {max_size})")]
    BatchPayloadTooLarge {
        index: usize,
        size: usize,
        max_size: usize,
    },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Dispatch unit {unit} failed: {message}")]
    DispatchFailed { unit: usize, message: String },

    /// A receive failed after some messages were already taken off the queue
    #[error("Receive failed with {} messages already received: {source}", .received.len())]
    ReceiveAborted {
        /// Messages the failed receive had already deleted, in order
        received: Vec<ReceivedMessage>,
        source: Box<QueueError>,
    },

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl QueueError {
    /// Check if error is transient and the operation could succeed if repeated
    pub fn is_transient(&self) -> bool {
        match self {
            Self::InvalidPayloadType { .. } => false,
            Self::QueueNotFound { .. } => false,
            Self::MessageNotFound { .. } => false,
            Self::ConnectionFailed { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::ProviderError { .. } => true, // Provider-specific errors are usually transient
            Self::PartialBatchFailure { .. } => true,
            Self::MessageTooLarge { .. } => false,
            Self::BatchTooLarge { .. } => false,
            Self::BatchPayloadTooLarge { .. } => false,
            Self::Timeout { .. } => true,
            Self::DispatchFailed { .. } => false,
            Self::ReceiveAborted { source, .. } => source.is_transient(),
            Self::SerializationError(_) => false,
            Self::ConfigurationError(_) => false,
            Self::ValidationError(_) => false,
        }
    }

    /// Check if the error came from the remote queue rather than local validation
    pub fn is_remote(&self) -> bool {
        match self {
            Self::ReceiveAborted { source, .. } => source.is_remote(),
            _ => matches!(
                self,
                Self::QueueNotFound { .. }
                    | Self::MessageNotFound { .. }
                    | Self::ConnectionFailed { .. }
                    | Self::AuthenticationFailed { .. }
                    | Self::ProviderError { .. }
                    | Self::PartialBatchFailure { .. }
                    | Self::Timeout { .. }
            ),
        }
    }

    /// Wrap `source` with messages already received, or return it as is
    pub(crate) fn receive_aborted(received: Vec<ReceivedMessage>, source: QueueError) -> Self {
        if received.is_empty() {
            return source;
        }
        Self::ReceiveAborted {
            received,
            source: Box::new(source),
        }
    }

    /// Split off the messages carried by [`QueueError::ReceiveAborted`]
    pub(crate) fn into_received(self) -> (Vec<ReceivedMessage>, QueueError) {
        match self {
            Self::ReceiveAborted { received, source } => (received, *source),
            error => (Vec::new(), error),
        }
    }
}

/// Errors during message serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Malformed provider response: {message}")]
    InvalidResponse { message: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::NotFound(key) => Self::Missing { key },
            other => Self::Parsing {
                message: other.to_string(),
            },
        }
    }
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
