//! Group-delivery abstraction.
//!
//! The broker never fans a message out itself. The hosting transport owns
//! the live sockets and their delivery groups; the broker drives it through
//! this trait and only keeps the membership bookkeeping.

use crate::connection::ConnectionId;
use crate::event::TrackingEvent;
use async_trait::async_trait;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection is gone.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Failed to deliver to a group.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Payload could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// The group-delivery primitive the broker consumes.
///
/// Implementations must not call back into the broker from these methods;
/// the broker holds no index lock across any of these calls, and expects
/// the same discipline in return.
#[async_trait]
pub trait GroupTransport: Send + Sync {
    /// Add a connection to a delivery group.
    async fn add_to_group(&self, handle: &ConnectionId, group: &str) -> Result<(), TransportError>;

    /// Remove a connection from a delivery group.
    ///
    /// Removing a connection that is not in the group is a no-op.
    async fn remove_from_group(
        &self,
        handle: &ConnectionId,
        group: &str,
    ) -> Result<(), TransportError>;

    /// Deliver an event to every member of a group.
    ///
    /// Returns the number of connections the event was handed to. Delivery
    /// to individual dead connections is the transport's concern and is not
    /// reported here.
    async fn send_to_group(&self, group: &str, event: &TrackingEvent)
        -> Result<usize, TransportError>;
}
