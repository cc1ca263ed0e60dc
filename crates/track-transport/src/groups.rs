//! In-process group router.
//!
//! Implements the broker's [`GroupTransport`] primitive over per-connection
//! outbound channels. An event is serialized once and the same bytes are
//! pushed to every member of the group.

use bytes::Bytes;
use dashmap::DashMap;
use livetrack_core::{ConnectionId, GroupTransport, TrackingEvent, TransportError};
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Outbound channel for one connection's serialized frames.
pub type OutboundSender = mpsc::UnboundedSender<Bytes>;

/// Delivery groups over per-connection outbound channels.
///
/// The server attaches a sender when a socket is accepted and detaches it
/// when the socket closes. Group membership here is the transport's own
/// bookkeeping; the broker keeps its subscription index in step through the
/// [`GroupTransport`] calls.
#[derive(Debug, Default)]
pub struct GroupRouter {
    /// Connection ID to its outbound channel.
    connections: DashMap<ConnectionId, OutboundSender>,
    /// Group key to member connection IDs.
    groups: DashMap<String, HashSet<ConnectionId>>,
}

impl GroupRouter {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection's outbound channel.
    pub fn attach(&self, handle: ConnectionId, sender: OutboundSender) {
        debug!(connection = %handle, "Connection attached");
        self.connections.insert(handle, sender);
    }

    /// Detach a connection: drop its channel and remove it from every group.
    pub fn detach(&self, handle: &ConnectionId) {
        self.connections.remove(handle);

        let mut drained = Vec::new();
        for mut entry in self.groups.iter_mut() {
            if entry.value_mut().remove(handle) && entry.value().is_empty() {
                drained.push(entry.key().clone());
            }
        }
        for group in drained {
            self.groups.remove_if(&group, |_, members| members.is_empty());
        }

        debug!(connection = %handle, "Connection detached");
    }

    /// Check whether a connection is attached.
    #[must_use]
    pub fn is_attached(&self, handle: &ConnectionId) -> bool {
        self.connections.contains_key(handle)
    }

    /// Number of attached connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of non-empty groups.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Drop members whose outbound channel is gone.
    fn prune_zombies(&self, group: &str, zombies: &[ConnectionId]) {
        for handle in zombies {
            self.connections.remove(handle);
            if let Some(mut members) = self.groups.get_mut(group) {
                members.remove(handle);
            }
            warn!(connection = %handle, group = %group, "Pruned dead connection");
        }
        self.groups.remove_if(group, |_, members| members.is_empty());
    }
}

#[async_trait::async_trait]
impl GroupTransport for GroupRouter {
    async fn add_to_group(&self, handle: &ConnectionId, group: &str) -> Result<(), TransportError> {
        if !self.connections.contains_key(handle) {
            return Err(TransportError::ConnectionClosed(handle.to_string()));
        }
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(handle.clone());
        trace!(connection = %handle, group = %group, "Added to group");
        Ok(())
    }

    async fn remove_from_group(
        &self,
        handle: &ConnectionId,
        group: &str,
    ) -> Result<(), TransportError> {
        if let Some(mut members) = self.groups.get_mut(group) {
            members.remove(handle);
        }
        self.groups.remove_if(group, |_, members| members.is_empty());
        trace!(connection = %handle, group = %group, "Removed from group");
        Ok(())
    }

    async fn send_to_group(
        &self,
        group: &str,
        event: &TrackingEvent,
    ) -> Result<usize, TransportError> {
        let members: Vec<ConnectionId> = match self.groups.get(group) {
            Some(members) => members.iter().cloned().collect(),
            None => return Ok(0),
        };

        // Serialize once; every member gets the same bytes.
        let frame = Bytes::from(serde_json::to_vec(event)?);

        let mut delivered = 0;
        let mut zombies = Vec::new();
        for handle in members {
            match self.connections.get(&handle) {
                Some(sender) if sender.send(frame.clone()).is_ok() => delivered += 1,
                _ => zombies.push(handle),
            }
        }

        if !zombies.is_empty() {
            self.prune_zombies(group, &zombies);
        }

        trace!(group = %group, delivered, "Group send");
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::new(id)
    }

    fn attach(router: &GroupRouter, id: &str) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        router.attach(conn(id), tx);
        rx
    }

    #[tokio::test]
    async fn test_send_reaches_all_members() {
        let router = GroupRouter::new();
        let mut rx_a = attach(&router, "a");
        let mut rx_b = attach(&router, "b");

        router.add_to_group(&conn("a"), "order:1").await.unwrap();
        router.add_to_group(&conn("b"), "order:1").await.unwrap();

        let event = TrackingEvent::new("order:1", json!({"status": "Preparing"}));
        let delivered = router.send_to_group("order:1", &event).await.unwrap();
        assert_eq!(delivered, 2);

        let frame = rx_a.try_recv().unwrap();
        let decoded: TrackingEvent = serde_json::from_slice(&frame).unwrap();
        assert_eq!(decoded.topic, "order:1");
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_add_unattached_connection_fails() {
        let router = GroupRouter::new();
        let result = router.add_to_group(&conn("ghost"), "order:1").await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_send_to_unknown_group_is_empty() {
        let router = GroupRouter::new();
        let event = TrackingEvent::new("nope", json!(null));
        assert_eq!(router.send_to_group("nope", &event).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_detach_leaves_no_membership() {
        let router = GroupRouter::new();
        let _rx = attach(&router, "a");
        let _rx_b = attach(&router, "b");

        router.add_to_group(&conn("a"), "order:1").await.unwrap();
        router.add_to_group(&conn("a"), "order:2").await.unwrap();
        router.add_to_group(&conn("b"), "order:1").await.unwrap();

        router.detach(&conn("a"));

        assert!(!router.is_attached(&conn("a")));
        // order:2 drained and was dropped; order:1 still has b.
        assert_eq!(router.group_count(), 1);

        let event = TrackingEvent::new("order:1", json!({}));
        assert_eq!(router.send_to_group("order:1", &event).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dead_receiver_is_pruned_on_send() {
        let router = GroupRouter::new();
        let rx = attach(&router, "a");
        let _rx_b = attach(&router, "b");

        router.add_to_group(&conn("a"), "order:1").await.unwrap();
        router.add_to_group(&conn("b"), "order:1").await.unwrap();

        drop(rx); // a's socket died without a clean detach

        let event = TrackingEvent::new("order:1", json!({}));
        assert_eq!(router.send_to_group("order:1", &event).await.unwrap(), 1);
        assert!(!router.is_attached(&conn("a")));
    }
}
