//! # livetrack-core
//!
//! In-memory order-tracking broker for the Livetrack realtime layer.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **ConnectionRegistry** - Caller identity to live connection mapping
//! - **TopicSubscriptionIndex** - Topic to subscriber-set index
//! - **StaleSubscriptionReaper** - Periodic compaction of empty topics
//! - **TrackingBroker** - Unified connect/topic/publish façade
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────┐     ┌───────────────────────┐
//! │  Transport  │────▶│  TrackingBroker  │────▶│ TopicSubscriptionIndex│
//! └─────────────┘     └──────────────────┘     └───────────────────────┘
//!                              │                           ▲
//!                              ▼                           │
//!                     ┌──────────────────┐     ┌───────────────────────┐
//!                     │ConnectionRegistry│     │StaleSubscriptionReaper│
//!                     └──────────────────┘     └───────────────────────┘
//! ```
//!
//! The broker never owns delivery: fan-out is delegated to the hosting
//! transport through the [`GroupTransport`] trait.

pub mod broker;
pub mod connection;
pub mod event;
pub mod reaper;
pub mod registry;
pub mod topics;
pub mod transport;

pub use broker::{BrokerConfig, BrokerError, TrackingBroker};
pub use connection::{ConnectionId, Identity};
pub use event::{LocationUpdate, TrackingEvent};
pub use reaper::StaleSubscriptionReaper;
pub use registry::ConnectionRegistry;
pub use topics::{IndexStats, TopicSubscriptionIndex};
pub use transport::{GroupTransport, TransportError};
