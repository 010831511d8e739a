//! Provider types and batching configuration.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Hard per-request message cap of AWS SQS batch calls
pub const SQS_MAX_BATCH_SIZE: usize = 10;

/// Enumeration of supported queue providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderType {
    AwsSqs,
    InMemory,
}

impl ProviderType {
    /// Get maximum number of messages per batch call
    pub fn max_batch_size(&self) -> usize {
        match self {
            Self::AwsSqs => SQS_MAX_BATCH_SIZE,
            // Mirrors SQS so tests exercise the same partitioning
            Self::InMemory => SQS_MAX_BATCH_SIZE,
        }
    }

    /// Get maximum message size for provider
    pub fn max_message_size(&self) -> usize {
        match self {
            Self::AwsSqs => 256 * 1024,         // 256KB
            Self::InMemory => 10 * 1024 * 1024, // 10MB
        }
    }

    /// Get maximum combined body size of one batch call
    pub fn max_batch_payload_size(&self) -> usize {
        match self {
            Self::AwsSqs => 256 * 1024,         // 256KB per SendMessageBatch
            Self::InMemory => 10 * 1024 * 1024, // 10MB
        }
    }

    /// Get maximum long-poll wait the provider accepts
    pub fn max_wait(&self) -> Duration {
        match self {
            Self::AwsSqs => Duration::from_secs(20),
            Self::InMemory => Duration::from_secs(20),
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwsSqs => write!(f, "AwsSqs"),
            Self::InMemory => write!(f, "InMemory"),
        }
    }
}

/// What to do when one dispatch unit fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Wait for every unit and report failures per batch
    #[default]
    CollectAll,
    /// Return the first failure and abort the units still running
    ///
    /// Messages that finished units already took off the queue come back in
    /// [`QueueError::ReceiveAborted`](crate::QueueError::ReceiveAborted). Under
    /// [`DeletePolicy::Eager`] a unit aborted or timed out part way through
    /// deleting loses the messages it had deleted.
    FailFast,
}

/// When received messages are deleted from the remote queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Delete inside the receiving unit before returning (at-most-once)
    #[default]
    Eager,
    /// Return messages undeleted; the caller acknowledges them after processing
    Deferred,
}

/// Configuration for the batching client
///
/// Durations are expressed in whole seconds so the structure maps directly onto
/// configuration files and environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    pub provider: ProviderConfig,
    /// Messages per batch call, at most the provider cap
    pub max_batch_size: usize,
    /// Long-poll wait for each receive call
    pub receive_wait_seconds: u64,
    /// Upper bound on a single dispatch unit; `None` waits indefinitely
    pub unit_timeout_seconds: Option<u64>,
    /// Dispatch units allowed to talk to the queue at the same time
    pub max_concurrent_units: usize,
    pub failure_policy: FailurePolicy,
    pub delete_policy: DeletePolicy,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::InMemory(InMemoryConfig::default()),
            max_batch_size: SQS_MAX_BATCH_SIZE,
            receive_wait_seconds: 3,
            unit_timeout_seconds: Some(30),
            max_concurrent_units: 16,
            failure_policy: FailurePolicy::default(),
            delete_policy: DeletePolicy::default(),
        }
    }
}

impl BatcherConfig {
    /// Load configuration from an optional YAML file and the environment
    ///
    /// Sources are applied in order, later ones overriding earlier ones:
    /// the built-in defaults, the file at `path` (if given), then environment
    /// variables prefixed `QUEUE_BATCHER__` with `__` as the nesting separator,
    /// e.g. `QUEUE_BATCHER__MAX_CONCURRENT_UNITS=4`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        // Absent keys fall back to the serde defaults
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .required(true)
                    .format(config::FileFormat::Yaml),
            );
        }

        let loaded: Self = builder
            .add_source(
                config::Environment::with_prefix("QUEUE_BATCHER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_batch_size == 0 {
            return Err(ConfigurationError::Invalid {
                message: "max_batch_size must be at least 1".to_string(),
            });
        }

        let provider_cap = self.provider.provider_type().max_batch_size();
        if self.max_batch_size > provider_cap {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "max_batch_size {} exceeds the {} limit of {}",
                    self.max_batch_size,
                    self.provider.provider_type(),
                    provider_cap
                ),
            });
        }

        if self.max_concurrent_units == 0 {
            return Err(ConfigurationError::Invalid {
                message: "max_concurrent_units must be at least 1".to_string(),
            });
        }

        if self.unit_timeout_seconds == Some(0) {
            return Err(ConfigurationError::Invalid {
                message: "unit_timeout_seconds must be positive when set".to_string(),
            });
        }

        let max_wait = self.provider.provider_type().max_wait();
        if self.receive_wait() > max_wait {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "receive_wait_seconds {} exceeds the provider maximum of {}",
                    self.receive_wait_seconds,
                    max_wait.as_secs()
                ),
            });
        }

        if let ProviderConfig::AwsSqs(aws) = &self.provider {
            if aws.region.is_empty() {
                return Err(ConfigurationError::Missing {
                    key: "provider.aws_sqs.region".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Long-poll wait for each receive call
    pub fn receive_wait(&self) -> Duration {
        Duration::from_secs(self.receive_wait_seconds)
    }

    /// Upper bound on a single dispatch unit
    pub fn unit_timeout(&self) -> Option<Duration> {
        self.unit_timeout_seconds.map(Duration::from_secs)
    }
}

/// Provider-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderConfig {
    AwsSqs(AwsSqsConfig),
    InMemory(InMemoryConfig),
}

impl ProviderConfig {
    pub fn provider_type(&self) -> ProviderType {
        match self {
            Self::AwsSqs(_) => ProviderType::AwsSqs,
            Self::InMemory(_) => ProviderType::InMemory,
        }
    }
}

/// AWS SQS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsSqsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Temporary credentials carry a session token alongside the key pair
    #[serde(default)]
    pub session_token: Option<String>,
    /// Per-request HTTP timeout
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_request_timeout_seconds() -> u64 {
    30
}

/// In-memory provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryConfig {
    /// Messages a single in-memory queue holds before rejecting sends
    pub max_queue_size: usize,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10000,
        }
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
