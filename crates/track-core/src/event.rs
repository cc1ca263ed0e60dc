//! Structured tracking events.
//!
//! Events are what the broker hands to the transport's group-send primitive:
//! order status changes, courier positions, restaurant updates. Payloads are
//! structured JSON and pass through the broker unvalidated.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in milliseconds.
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// An event published to a topic group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingEvent {
    /// Target topic (e.g. `order:42`, `courier:7`).
    pub topic: String,
    /// Optional event name (e.g. `status`, `location`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    /// Structured payload.
    pub payload: serde_json::Value,
    /// Timestamp when the event was created (unix millis).
    pub timestamp: u64,
}

impl TrackingEvent {
    /// Create a new event for a topic.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            event: None,
            payload,
            timestamp: unix_millis(),
        }
    }

    /// Attach an event name.
    #[must_use]
    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }
}

/// A courier/caller position report.
///
/// Coordinates are not range-checked at this layer: malformed values pass
/// through to subscribers as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationUpdate {
    /// The identity reporting its position.
    pub identity: String,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Timestamp when the report was taken (unix millis).
    pub timestamp: u64,
}

impl LocationUpdate {
    /// Create a location update stamped with the current time.
    #[must_use]
    pub fn new(identity: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            identity: identity.into(),
            latitude,
            longitude,
            timestamp: unix_millis(),
        }
    }

    /// Convert into a tracking event on the identity's own topic.
    ///
    /// Location updates are broadcast on the topic named after the identity,
    /// so anyone tracking that courier subscribes to its identity string.
    #[must_use]
    pub fn into_event(self) -> TrackingEvent {
        let topic = self.identity.clone();
        let timestamp = self.timestamp;
        TrackingEvent {
            topic,
            event: Some("location".to_string()),
            payload: serde_json::to_value(&self).unwrap_or(serde_json::Value::Null),
            timestamp,
        }
    }
}
