//! Message types for batching operations including core domain identifiers.

use crate::error::{QueueError, ValidationError};
use crate::provider::ProviderType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Opaque address of a remote queue (for SQS, the queue URL)
///
/// Only emptiness is checked here; whether the address actually names a
/// reachable queue is for the provider to decide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueEndpoint(String);

impl QueueEndpoint {
    /// Create new queue endpoint
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ValidationError> {
        let endpoint = endpoint.into();
        if endpoint.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "endpoint".to_string(),
            });
        }

        Ok(Self(endpoint))
    }

    /// Get endpoint as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueEndpoint {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Identifier the remote queue assigned to a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4();
        Self(id.to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// One item that can be sent as a message body
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadItem {
    /// Sent verbatim
    Text(String),
    /// Serialized to JSON text before sending
    Record(Map<String, Value>),
}

impl PayloadItem {
    /// Render the item as the message body the queue will store
    pub fn to_body(&self) -> Result<String, QueueError> {
        match self {
            Self::Text(text) => Ok(text.clone()),
            Self::Record(record) => serde_json::to_string(record)
                .map_err(|e| QueueError::SerializationError(e.into())),
        }
    }

    fn from_json(value: Value) -> Result<Self, QueueError> {
        match value {
            Value::String(text) => Ok(Self::Text(text)),
            Value::Object(record) => Ok(Self::Record(record)),
            other => Err(QueueError::InvalidPayloadType {
                found: format!("list containing {}", json_kind(&other)),
            }),
        }
    }
}

impl From<&str> for PayloadItem {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for PayloadItem {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Map<String, Value>> for PayloadItem {
    fn from(record: Map<String, Value>) -> Self {
        Self::Record(record)
    }
}

/// Everything `send` accepts: a single text, a single record, or a list of either
///
/// Lists longer than the provider batch cap are partitioned before dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Record(Map<String, Value>),
    Batch(Vec<PayloadItem>),
}

impl Payload {
    /// Build a record payload from any serializable value
    ///
    /// The value must serialize to a JSON object.
    pub fn record<T: Serialize>(value: &T) -> Result<Self, QueueError> {
        match serde_json::to_value(value).map_err(|e| QueueError::SerializationError(e.into()))? {
            Value::Object(record) => Ok(Self::Record(record)),
            other => Err(QueueError::InvalidPayloadType {
                found: json_kind(&other).to_string(),
            }),
        }
    }

    /// Map a dynamically typed JSON value onto a payload
    ///
    /// Strings become text, objects become records and arrays of strings or
    /// objects become batches. Anything else is rejected.
    pub fn from_json(value: Value) -> Result<Self, QueueError> {
        match value {
            Value::String(text) => Ok(Self::Text(text)),
            Value::Object(record) => Ok(Self::Record(record)),
            Value::Array(items) => items
                .into_iter()
                .map(PayloadItem::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Batch),
            other => Err(QueueError::InvalidPayloadType {
                found: json_kind(&other).to_string(),
            }),
        }
    }

    /// Number of messages this payload produces
    pub fn len(&self) -> usize {
        match self {
            Self::Text(_) | Self::Record(_) => 1,
            Self::Batch(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(record: Map<String, Value>) -> Self {
        Self::Record(record)
    }
}

impl<T: Into<PayloadItem>> From<Vec<T>> for Payload {
    fn from(items: Vec<T>) -> Self {
        Self::Batch(items.into_iter().map(Into::into).collect())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "record",
    }
}

// ============================================================================
// Wire Types
// ============================================================================

/// One entry of a multi-message send call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    /// Identifier unique only within the batch it belongs to
    pub id: String,
    pub body: String,
}

impl BatchEntry {
    pub fn new(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
        }
    }
}

/// A message received from the queue
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub body: String,
    pub receipt_handle: ReceiptHandle,
    pub delivery_count: u32,
}

/// Opaque token for deleting a received message
///
/// Carries the endpoint it was issued for, since a receipt is only valid
/// against the queue that handed it out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptHandle {
    handle: String,
    endpoint: QueueEndpoint,
    provider_type: ProviderType,
}

impl ReceiptHandle {
    /// Create new receipt handle
    pub fn new(handle: String, endpoint: QueueEndpoint, provider_type: ProviderType) -> Self {
        Self {
            handle,
            endpoint,
            provider_type,
        }
    }

    /// Get handle string
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Endpoint of the queue that issued this receipt
    pub fn endpoint(&self) -> &QueueEndpoint {
        &self.endpoint
    }

    /// Get provider type
    pub fn provider_type(&self) -> ProviderType {
        self.provider_type
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
