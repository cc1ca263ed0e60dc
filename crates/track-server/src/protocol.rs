//! Client message protocol.
//!
//! The tracking endpoint speaks newline-free JSON text frames. The core
//! owns no wire framing; this is purely the hosting layer's surface toward
//! web and mobile clients.

use serde::{Deserialize, Serialize};

/// A message from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to a topic group.
    Join { topic: String },
    /// Unsubscribe from a topic group.
    Leave { topic: String },
    /// Publish a structured event to a topic group.
    Publish {
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
        payload: serde_json::Value,
    },
    /// Report the caller's current position.
    Location { latitude: f64, longitude: f64 },
    /// Keepalive.
    Ping,
}

/// A control message to a client. Tracking events themselves are delivered
/// as serialized [`livetrack_core::TrackingEvent`] frames, not through this
/// enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The requested operation succeeded.
    Ack { op: String },
    /// The requested operation failed.
    Error { op: String, message: String },
    /// Keepalive reply.
    Pong,
}

impl ServerMessage {
    /// Ack for an operation.
    #[must_use]
    pub fn ack(op: impl Into<String>) -> Self {
        Self::Ack { op: op.into() }
    }

    /// Error for an operation.
    #[must_use]
    pub fn error(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            op: op.into(),
            message: message.into(),
        }
    }
}
