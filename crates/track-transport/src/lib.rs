//! # livetrack-transport
//!
//! Group-delivery layer for Livetrack.
//!
//! The broker core only knows "send event E to group G"; this crate owns
//! the other half: which live connections sit behind a group, and the
//! outbound channel each connection drains into its socket. The hosting
//! server attaches a sender per accepted connection and pumps the matching
//! receiver into the socket write half.

pub mod groups;

pub use groups::{GroupRouter, OutboundSender};
