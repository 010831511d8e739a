//! AWS SQS provider implementation using the HTTP query API.
//!
//! Requests go straight to the queue URL as signed form posts instead of
//! through the AWS SDK, so response handling can be unit tested against
//! canned XML.
//!
//! ## Endpoints
//!
//! An endpoint is the full queue URL, for example
//! `https://sqs.us-east-1.amazonaws.com/123456789012/orders`. Connecting only
//! parses it; the first request is what reveals a missing queue.
//!
//! ## Authentication
//!
//! Requests are signed with AWS Signature Version 4 using the configured
//! access key pair. Temporary credentials add their session token as
//! `x-amz-security-token`. Without credentials every request fails with an
//! authentication error.
//!
//! ## Limits
//!
//! - At most 10 entries per `SendMessageBatch`
//! - At most 10 messages per `ReceiveMessage`
//! - Long-poll wait capped at 20 seconds
//!
//! Message bodies are sent as plain text.

use crate::client::{QueueConnection, QueueConnector};
use crate::error::{ConfigurationError, QueueError, SerializationError, ValidationError};
use crate::message::{BatchEntry, MessageId, QueueEndpoint, ReceiptHandle, ReceivedMessage};
use crate::provider::{AwsSqsConfig, ProviderType, SQS_MAX_BATCH_SIZE};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client as HttpClient;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[cfg(test)]
#[path = "aws_tests.rs"]
mod tests;

const API_VERSION: &str = "2012-11-05";

// ============================================================================
// Error Types
// ============================================================================

/// AWS SQS specific errors
#[derive(Debug, thiserror::Error)]
pub enum AwsError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("SQS service error: {code}: {message}")]
    ServiceError { code: String, message: String },

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Invalid receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("Invalid queue URL '{url}': {message}")]
    InvalidEndpoint { url: String, message: String },

    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    #[error("Malformed response: {0}")]
    SerializationError(String),
}

impl AwsError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Authentication(_) => false,
            Self::NetworkError(_) => true,
            Self::ServiceError { .. } => true,
            Self::QueueNotFound(_) => false,
            Self::InvalidReceipt(_) => false,
            Self::InvalidEndpoint { .. } => false,
            Self::ConfigurationError(_) => false,
            Self::SerializationError(_) => false,
        }
    }

    /// Map AWS error to QueueError
    pub fn to_queue_error(self) -> QueueError {
        match self {
            Self::Authentication(message) => QueueError::AuthenticationFailed { message },
            Self::NetworkError(message) => QueueError::ConnectionFailed { message },
            Self::ServiceError { code, message } => QueueError::ProviderError {
                provider: ProviderType::AwsSqs.to_string(),
                code,
                message,
            },
            Self::QueueNotFound(endpoint) => QueueError::QueueNotFound { endpoint },
            Self::InvalidReceipt(receipt) => QueueError::MessageNotFound { receipt },
            Self::InvalidEndpoint { url, message } => {
                QueueError::ValidationError(ValidationError::InvalidFormat {
                    field: "endpoint".to_string(),
                    message: format!("{}: {}", url, message),
                })
            }
            Self::ConfigurationError(message) => {
                QueueError::ConfigurationError(ConfigurationError::Invalid { message })
            }
            Self::SerializationError(message) => {
                QueueError::SerializationError(SerializationError::InvalidResponse { message })
            }
        }
    }
}

// ============================================================================
// AWS Signature V4 Signing
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// AWS Signature Version 4 signer for request authentication
///
/// Implements the AWS Signature V4 signing process:
/// 1. Create canonical request (method, URI, query, headers, payload)
/// 2. Create string to sign (algorithm, timestamp, scope, request hash)
/// 3. Derive signing key (4-level HMAC chain)
/// 4. Calculate signature and build Authorization header
#[derive(Clone)]
struct AwsV4Signer {
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
    region: String,
    service: String,
}

impl AwsV4Signer {
    fn new(
        access_key: String,
        secret_key: String,
        session_token: Option<String>,
        region: String,
    ) -> Self {
        Self {
            access_key,
            secret_key,
            session_token,
            region,
            service: "sqs".to_string(),
        }
    }

    /// Sign a request whose parameters travel in the body
    ///
    /// Returns the headers to add to the request: `Authorization`,
    /// `x-amz-date`, `host` and, for temporary credentials,
    /// `x-amz-security-token`.
    fn sign_request(
        &self,
        method: &str,
        host: &str,
        path: &str,
        body: &str,
        timestamp: &DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        // Canonical headers must be sorted by name
        let mut canonical_headers = format!("host:{}\nx-amz-date:{}\n", host, amz_date);
        let mut signed_headers = "host;x-amz-date".to_string();
        if let Some(token) = &self.session_token {
            canonical_headers.push_str(&format!("x-amz-security-token:{}\n", token));
            signed_headers.push_str(";x-amz-security-token");
        }

        let payload_hash = format!("{:x}", Sha256::digest(body.as_bytes()));

        // Empty line is the canonical query string
        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method, path, canonical_headers, signed_headers, payload_hash
        );

        let algorithm = "AWS4-HMAC-SHA256";
        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );
        let canonical_request_hash = format!("{:x}", Sha256::digest(canonical_request.as_bytes()));

        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            algorithm, amz_date, credential_scope, canonical_request_hash
        );

        let signature = self.calculate_signature(&string_to_sign, &date_stamp);

        let authorization_header = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            algorithm, self.access_key, credential_scope, signed_headers, signature
        );

        let mut headers = vec![
            ("Authorization".to_string(), authorization_header),
            ("x-amz-date".to_string(), amz_date),
            ("host".to_string(), host.to_string()),
        ];
        if let Some(token) = &self.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }

        headers
    }

    /// Derive the signing key through the HMAC chain and sign
    fn calculate_signature(&self, string_to_sign: &str, date_stamp: &str) -> String {
        let k_secret = format!("AWS4{}", self.secret_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        let signature = hmac_sha256(&k_signing, string_to_sign.as_bytes());

        hex::encode(signature)
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

// ============================================================================
// AWS SQS Connector
// ============================================================================

/// Opens connections to SQS queue URLs
///
/// The HTTP client is shared by every connection this connector opens, so
/// connections are cheap and each dispatch unit can hold its own.
pub struct AwsSqsConnector {
    http_client: HttpClient,
    signer: Option<AwsV4Signer>,
    config: AwsSqsConfig,
}

impl AwsSqsConnector {
    /// Create new SQS connector
    ///
    /// # Errors
    ///
    /// Returns error if the region is empty or the HTTP client cannot be built.
    pub fn new(config: AwsSqsConfig) -> Result<Self, AwsError> {
        if config.region.trim().is_empty() {
            return Err(AwsError::ConfigurationError(
                "Region cannot be empty".to_string(),
            ));
        }

        let signer = match (&config.access_key_id, &config.secret_access_key) {
            (Some(access_key), Some(secret_key)) => Some(AwsV4Signer::new(
                access_key.clone(),
                secret_key.clone(),
                config.session_token.clone(),
                config.region.clone(),
            )),
            _ => None,
        };

        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| AwsError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            signer,
            config,
        })
    }
}

impl fmt::Debug for AwsSqsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsSqsConnector")
            .field("region", &self.config.region)
            .field("credentials", &self.signer.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
impl QueueConnector for AwsSqsConnector {
    async fn connect(
        &self,
        endpoint: &QueueEndpoint,
    ) -> Result<Arc<dyn QueueConnection>, QueueError> {
        let connection = AwsSqsConnection::new(
            self.http_client.clone(),
            self.signer.clone(),
            endpoint.clone(),
        )
        .map_err(|e| e.to_queue_error())?;

        Ok(Arc::new(connection))
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::AwsSqs
    }
}

// ============================================================================
// AWS SQS Connection
// ============================================================================

/// Connection bound to one SQS queue URL
pub struct AwsSqsConnection {
    http_client: HttpClient,
    signer: Option<AwsV4Signer>,
    endpoint: QueueEndpoint,
    url: Url,
    host: String,
}

impl AwsSqsConnection {
    fn new(
        http_client: HttpClient,
        signer: Option<AwsV4Signer>,
        endpoint: QueueEndpoint,
    ) -> Result<Self, AwsError> {
        let url = Url::parse(endpoint.as_str()).map_err(|e| AwsError::InvalidEndpoint {
            url: endpoint.to_string(),
            message: e.to_string(),
        })?;

        if !matches!(url.scheme(), "https" | "http") {
            return Err(AwsError::InvalidEndpoint {
                url: endpoint.to_string(),
                message: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(AwsError::InvalidEndpoint {
                    url: endpoint.to_string(),
                    message: "missing host".to_string(),
                })
            }
        };

        Ok(Self {
            http_client,
            signer,
            endpoint,
            url,
            host,
        })
    }

    /// Post a signed action to the queue URL and return the response body
    async fn make_request(
        &self,
        action: &str,
        params: Vec<(String, String)>,
    ) -> Result<String, AwsError> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| AwsError::Authentication("No credentials configured".to_string()))?;

        let body = encode_form(action, params);
        let timestamp = Utc::now();
        let auth_headers = signer.sign_request("POST", &self.host, self.url.path(), &body, &timestamp);

        let mut request = self
            .http_client
            .post(self.url.clone())
            .header("content-type", "application/x-www-form-urlencoded");
        for (key, value) in auth_headers {
            request = request.header(key.as_str(), value);
        }

        debug!(action, endpoint = %self.endpoint, "Sending SQS request");

        let response = request.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                AwsError::NetworkError(format!("Request timeout: {}", e))
            } else if e.is_connect() {
                AwsError::NetworkError(format!("Connection failed: {}", e))
            } else {
                AwsError::NetworkError(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let response_body = response
            .text()
            .await
            .map_err(|e| AwsError::NetworkError(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(parse_error_response(&response_body, status.as_u16()));
        }

        Ok(response_body)
    }
}

impl fmt::Debug for AwsSqsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsSqsConnection")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[async_trait]
impl QueueConnection for AwsSqsConnection {
    async fn send_message(&self, body: &str) -> Result<MessageId, QueueError> {
        let params = vec![("MessageBody".to_string(), body.to_string())];

        let response = self
            .make_request("SendMessage", params)
            .await
            .map_err(|e| e.to_queue_error())?;

        parse_send_message_response(&response).map_err(|e| e.to_queue_error())
    }

    async fn send_message_batch(
        &self,
        entries: &[BatchEntry],
    ) -> Result<Vec<MessageId>, QueueError> {
        if entries.is_empty() {
            return Err(ValidationError::Required {
                field: "entries".to_string(),
            }
            .into());
        }

        if entries.len() > SQS_MAX_BATCH_SIZE {
            return Err(QueueError::BatchTooLarge {
                size: entries.len(),
                max_size: SQS_MAX_BATCH_SIZE,
            });
        }

        let mut params = Vec::with_capacity(entries.len() * 2);
        for (position, entry) in entries.iter().enumerate() {
            let n = position + 1;
            params.push((
                format!("SendMessageBatchRequestEntry.{}.Id", n),
                entry.id.clone(),
            ));
            params.push((
                format!("SendMessageBatchRequestEntry.{}.MessageBody", n),
                entry.body.clone(),
            ));
        }

        let response = self
            .make_request("SendMessageBatch", params)
            .await
            .map_err(|e| e.to_queue_error())?;

        let result = parse_send_message_batch_response(&response).map_err(|e| e.to_queue_error())?;
        result.into_message_ids(entries)
    }

    async fn receive_messages(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let wait_seconds = wait.as_secs().min(ProviderType::AwsSqs.max_wait().as_secs());
        let params = vec![
            (
                "MaxNumberOfMessages".to_string(),
                max_messages.clamp(1, SQS_MAX_BATCH_SIZE).to_string(),
            ),
            ("WaitTimeSeconds".to_string(), wait_seconds.to_string()),
            (
                "AttributeName.1".to_string(),
                "ApproximateReceiveCount".to_string(),
            ),
        ];

        let response = self
            .make_request("ReceiveMessage", params)
            .await
            .map_err(|e| e.to_queue_error())?;

        parse_receive_message_response(&response, &self.endpoint).map_err(|e| e.to_queue_error())
    }

    async fn delete_message(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        let params = vec![(
            "ReceiptHandle".to_string(),
            message.receipt_handle.handle().to_string(),
        )];

        // DeleteMessage returns an empty result on success
        self.make_request("DeleteMessage", params)
            .await
            .map_err(|e| e.to_queue_error())?;

        Ok(())
    }

    fn endpoint(&self) -> &QueueEndpoint {
        &self.endpoint
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::AwsSqs
    }
}

// ============================================================================
// Request Encoding
// ============================================================================

/// Form-encode the action and its parameters, sorted by name
fn encode_form(action: &str, mut params: Vec<(String, String)>) -> String {
    params.push(("Action".to_string(), action.to_string()));
    params.push(("Version".to_string(), API_VERSION.to_string()));
    params.sort();

    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

// ============================================================================
// Response Parsing
// ============================================================================

/// Entry the queue rejected inside a `SendMessageBatch`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct BatchEntryError {
    id: String,
    code: String,
    message: String,
    sender_fault: bool,
}

/// Parsed `SendMessageBatch` result
#[derive(Debug, Default)]
struct BatchSendResult {
    /// Entry id to assigned message id
    successful: HashMap<String, MessageId>,
    failed: Vec<BatchEntryError>,
}

impl BatchSendResult {
    /// Message ids in entry order, or the rejected entries as an error
    ///
    /// A partial failure still carries the ids of the accepted entries so the
    /// caller does not resend messages that are already queued.
    fn into_message_ids(mut self, entries: &[BatchEntry]) -> Result<Vec<MessageId>, QueueError> {
        if self.failed.is_empty() {
            return entries
                .iter()
                .map(|entry| {
                    self.successful.remove(&entry.id).ok_or_else(|| {
                        QueueError::SerializationError(SerializationError::InvalidResponse {
                            message: format!("no result for batch entry '{}'", entry.id),
                        })
                    })
                })
                .collect();
        }

        let succeeded = entries
            .iter()
            .filter_map(|entry| self.successful.remove(&entry.id))
            .collect();

        Err(QueueError::PartialBatchFailure {
            failed: self
                .failed
                .iter()
                .map(|f| format!("{}: {} ({})", f.id, f.code, f.message))
                .collect(),
            succeeded,
        })
    }
}

fn xml_error(e: impl fmt::Display) -> AwsError {
    AwsError::SerializationError(format!("XML parsing error: {}", e))
}

/// Parse error response from XML
fn parse_error_response(xml: &str, status_code: u16) -> AwsError {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut error_code = None;
    let mut error_message = None;
    let mut in_error = false;
    let mut in_code = false;
    let mut in_message = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"Error" => in_error = true,
                b"Code" if in_error => in_code = true,
                b"Message" if in_error => in_message = true,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_code {
                    error_code = e.unescape().ok().map(|s| s.into_owned());
                    in_code = false;
                } else if in_message {
                    error_message = e.unescape().ok().map(|s| s.into_owned());
                    in_message = false;
                }
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"Error" => {
                in_error = false;
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    let code = error_code.unwrap_or_else(|| "Unknown".to_string());
    let message = error_message.unwrap_or_else(|| "Unknown error".to_string());

    match code.as_str() {
        "AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist" => {
            AwsError::QueueNotFound(message)
        }
        "InvalidClientTokenId" | "UnrecognizedClientException" | "SignatureDoesNotMatch" => {
            AwsError::Authentication(format!("{}: {}", code, message))
        }
        "ReceiptHandleIsInvalid" | "InvalidReceiptHandle" => AwsError::InvalidReceipt(message),
        _ if status_code == 401 || status_code == 403 => {
            AwsError::Authentication(format!("{}: {}", code, message))
        }
        _ => AwsError::ServiceError { code, message },
    }
}

/// Parse SendMessage XML response
fn parse_send_message_response(xml: &str) -> Result<MessageId, AwsError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut in_message_id = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"MessageId" => {
                in_message_id = true;
            }
            Ok(Event::Text(e)) if in_message_id => {
                let raw = e.unescape().map_err(xml_error)?;
                return MessageId::from_str(&raw)
                    .map_err(|e| AwsError::SerializationError(e.to_string()));
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
        buf.clear();
    }

    Err(AwsError::SerializationError(
        "MessageId not found in response".to_string(),
    ))
}

/// Parse SendMessageBatch XML response
fn parse_send_message_batch_response(xml: &str) -> Result<BatchSendResult, AwsError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Section {
        None,
        Success,
        Failure,
    }

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut result = BatchSendResult::default();
    let mut section = Section::None;
    let mut field: Option<Vec<u8>> = None;
    let mut entry_id = String::new();
    let mut message_id = None;
    let mut failure = BatchEntryError::default();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"SendMessageBatchResultEntry" => {
                    section = Section::Success;
                    entry_id.clear();
                    message_id = None;
                }
                b"BatchResultErrorEntry" => {
                    section = Section::Failure;
                    failure = BatchEntryError::default();
                }
                name if section != Section::None => field = Some(name.to_vec()),
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if let Some(name) = field.take() {
                    let text = e.unescape().map_err(xml_error)?.into_owned();
                    match (section, name.as_slice()) {
                        (Section::Success, b"Id") => entry_id = text,
                        (Section::Success, b"MessageId") => message_id = Some(text),
                        (Section::Failure, b"Id") => failure.id = text,
                        (Section::Failure, b"Code") => failure.code = text,
                        (Section::Failure, b"Message") => failure.message = text,
                        (Section::Failure, b"SenderFault") => failure.sender_fault = text == "true",
                        _ => {}
                    }
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"SendMessageBatchResultEntry" => {
                    section = Section::None;
                    let raw = message_id.take().ok_or_else(|| {
                        AwsError::SerializationError(format!(
                            "MessageId missing for batch entry '{}'",
                            entry_id
                        ))
                    })?;
                    let id = MessageId::from_str(&raw)
                        .map_err(|e| AwsError::SerializationError(e.to_string()))?;
                    result.successful.insert(std::mem::take(&mut entry_id), id);
                }
                b"BatchResultErrorEntry" => {
                    section = Section::None;
                    result.failed.push(std::mem::take(&mut failure));
                }
                _ => field = None,
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(result)
}

/// Parse ReceiveMessage XML response
///
/// Text is not trimmed by the reader: `<Body>` is kept exactly as the queue
/// returned it and only the structural fields are trimmed here.
fn parse_receive_message_response(
    xml: &str,
    endpoint: &QueueEndpoint,
) -> Result<Vec<ReceivedMessage>, AwsError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Field {
        None,
        MessageId,
        ReceiptHandle,
        Body,
        AttributeName,
        AttributeValue,
    }

    let mut reader = Reader::from_str(xml);

    let mut messages = Vec::new();
    let mut in_message = false;
    let mut field = Field::None;
    let mut current_message_id: Option<String> = None;
    let mut current_receipt_handle: Option<String> = None;
    let mut current_body = String::new();
    let mut current_delivery_count: u32 = 1;
    let mut current_attribute_name: Option<String> = None;

    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"Message" => {
                    in_message = true;
                    field = Field::None;
                    current_message_id = None;
                    current_receipt_handle = None;
                    current_body.clear();
                    current_delivery_count = 1;
                }
                b"MessageId" if in_message => field = Field::MessageId,
                b"ReceiptHandle" if in_message => field = Field::ReceiptHandle,
                b"Body" if in_message => field = Field::Body,
                b"Name" if in_message => field = Field::AttributeName,
                b"Value" if in_message => field = Field::AttributeValue,
                _ => field = Field::None,
            },
            Ok(Event::Text(e)) if field != Field::None => {
                let text = e.unescape().map_err(xml_error)?;
                match field {
                    Field::MessageId => current_message_id = Some(text.trim().to_string()),
                    Field::ReceiptHandle => {
                        current_receipt_handle = Some(text.trim().to_string())
                    }
                    Field::Body => current_body.push_str(&text),
                    Field::AttributeName => {
                        current_attribute_name = Some(text.trim().to_string())
                    }
                    Field::AttributeValue => {
                        if current_attribute_name.as_deref() == Some("ApproximateReceiveCount") {
                            current_delivery_count = text.trim().parse().unwrap_or(1);
                        }
                    }
                    Field::None => {}
                }
            }
            Ok(Event::CData(e)) if field == Field::Body => {
                let raw = e.into_inner();
                current_body.push_str(&String::from_utf8_lossy(&raw));
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"Message" => {
                in_message = false;
                field = Field::None;

                let (Some(message_id), Some(receipt_handle)) =
                    (current_message_id.take(), current_receipt_handle.take())
                else {
                    return Err(AwsError::SerializationError(
                        "Message without MessageId or ReceiptHandle".to_string(),
                    ));
                };

                let message_id = MessageId::from_str(&message_id)
                    .map_err(|e| AwsError::SerializationError(e.to_string()))?;

                messages.push(ReceivedMessage {
                    message_id,
                    // An empty <Body/> produces no text event
                    body: std::mem::take(&mut current_body),
                    receipt_handle: ReceiptHandle::new(
                        receipt_handle,
                        endpoint.clone(),
                        ProviderType::AwsSqs,
                    ),
                    delivery_count: current_delivery_count,
                });
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"Attribute" {
                    current_attribute_name = None;
                }
                field = Field::None;
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(messages)
}
