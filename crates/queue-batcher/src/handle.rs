//! Binding of a queue endpoint to the connection that talks to it.

use crate::client::{QueueConnection, QueueConnector};
use crate::error::QueueError;
use crate::message::QueueEndpoint;
use std::fmt;
use std::sync::Arc;

#[cfg(test)]
#[path = "handle_tests.rs"]
mod tests;

/// Immutable pairing of an endpoint with a connection bound to it
///
/// A handle never changes its endpoint. Pointing at another queue produces a
/// new handle through [`QueueHandle::reconnect`], so a connection built for one
/// endpoint cannot be used for another.
#[derive(Clone)]
pub struct QueueHandle {
    endpoint: QueueEndpoint,
    connection: Arc<dyn QueueConnection>,
    connector: Arc<dyn QueueConnector>,
}

impl QueueHandle {
    /// Open a connection to `endpoint` and bind it into a handle
    pub async fn connect(
        connector: Arc<dyn QueueConnector>,
        endpoint: QueueEndpoint,
    ) -> Result<Self, QueueError> {
        let connection = connector.connect(&endpoint).await?;
        Ok(Self {
            endpoint,
            connection,
            connector,
        })
    }

    /// Build a handle for another endpoint through the same connector
    pub async fn reconnect(&self, endpoint: QueueEndpoint) -> Result<Self, QueueError> {
        Self::connect(Arc::clone(&self.connector), endpoint).await
    }

    pub fn endpoint(&self) -> &QueueEndpoint {
        &self.endpoint
    }

    pub fn connection(&self) -> &Arc<dyn QueueConnection> {
        &self.connection
    }

    /// Connector used to open additional connections, one per dispatch unit
    pub fn connector(&self) -> &Arc<dyn QueueConnector> {
        &self.connector
    }
}

impl fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueHandle")
            .field("endpoint", &self.endpoint)
            .field("provider", &self.connection.provider_type())
            .finish()
    }
}
