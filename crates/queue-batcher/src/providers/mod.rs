//! Queue provider implementations.
//!
//! Each provider supplies a `QueueConnector` that opens connections and the
//! `QueueConnection` those connections implement.

pub mod aws;
pub mod memory;

pub use aws::{AwsError, AwsSqsConnection, AwsSqsConnector};
pub use memory::{InMemoryConnection, InMemoryConnector, Operation, RecordedCall};
