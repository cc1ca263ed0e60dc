//! The tracking broker façade.
//!
//! The broker composes the connection registry and the topic subscription
//! index, keeps them in step with the transport's delivery groups, and owns
//! the reaper's lifecycle. It is an explicitly constructed instance with an
//! injected transport; nothing here is process-global.

use crate::connection::ConnectionId;
use crate::event::{LocationUpdate, TrackingEvent};
use crate::reaper::StaleSubscriptionReaper;
use crate::registry::ConnectionRegistry;
use crate::topics::{IndexStats, TopicSubscriptionIndex};
use crate::transport::{GroupTransport, TransportError};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Broker errors.
///
/// Membership-only operations (connect, disconnect) never fail; only
/// operations that touch the transport surface errors, and those are the
/// transport's.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The transport rejected a group operation.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Interval between reaper sweeps.
    pub reap_interval: Duration,
    /// Hook invoked after every sweep with the number of topics removed.
    ///
    /// The hosting layer uses this to export reap counts as metrics; the
    /// broker itself only logs them.
    pub on_reap: Option<fn(usize)>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_secs(600),
            on_reap: None,
        }
    }
}

/// The order-tracking broker.
///
/// One instance per process is the expected deployment, but nothing stops
/// independent instances coexisting (isolated tests do exactly that).
pub struct TrackingBroker {
    registry: ConnectionRegistry,
    topics: Arc<TopicSubscriptionIndex>,
    transport: Arc<dyn GroupTransport>,
    reaper: Mutex<Option<StaleSubscriptionReaper>>,
}

impl TrackingBroker {
    /// Create a broker without starting the reaper.
    ///
    /// Useful in tests that drive sweeps by hand; production code should
    /// use [`start`](Self::start).
    #[must_use]
    pub fn new(transport: Arc<dyn GroupTransport>) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            topics: Arc::new(TopicSubscriptionIndex::new()),
            transport,
            reaper: Mutex::new(None),
        }
    }

    /// Create a broker and spawn its reaper.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(transport: Arc<dyn GroupTransport>, config: BrokerConfig) -> Self {
        let broker = Self::new(transport);
        let topics = broker.topics.clone();
        let on_reap = config.on_reap;
        let reaper = StaleSubscriptionReaper::spawn(
            move || {
                let removed = topics.sweep_empty();
                if let Some(hook) = on_reap {
                    hook(removed);
                }
                removed
            },
            config.reap_interval,
        );
        *broker.reaper.lock().unwrap() = Some(reaper);
        info!(reap_interval_secs = config.reap_interval.as_secs(), "Broker started");
        broker
    }

    /// A connection came up: bind the identity to its handle.
    ///
    /// Reconnecting replaces the stored handle without touching the old
    /// handle's topic memberships; those drain via the old connection's own
    /// disconnect, or get reaped.
    pub fn on_connect(&self, identity: &str, handle: ConnectionId) {
        debug!(identity = %identity, connection = %handle, "Connect");
        self.registry.register(identity, handle);
    }

    /// A connection went down: drop the identity mapping and purge the
    /// handle from every topic.
    ///
    /// Both steps always run; disconnect cleanup is not cancellable. The
    /// identity is unregistered unconditionally, so a stale disconnect that
    /// arrives after a reconnect drops the fresh mapping too (documented
    /// behavior, kept as-is).
    pub fn on_disconnect(&self, identity: &str, handle: &ConnectionId) {
        debug!(identity = %identity, connection = %handle, "Disconnect");
        self.registry.unregister(identity);
        self.topics.purge_connection(handle);
    }

    /// Subscribe a connection to a topic.
    ///
    /// The transport-level group add happens first; the index entry is
    /// recorded only on success, so the two sides cannot drift apart on a
    /// failed join.
    pub async fn join_topic(&self, topic: &str, handle: &ConnectionId) -> Result<(), BrokerError> {
        self.transport.add_to_group(handle, topic).await?;
        self.topics.join(topic, handle.clone());
        Ok(())
    }

    /// Unsubscribe a connection from a topic.
    ///
    /// The index entry goes first: the index must not keep a member the
    /// caller asked to remove, even if the transport-side removal fails.
    pub async fn leave_topic(&self, topic: &str, handle: &ConnectionId) -> Result<(), BrokerError> {
        self.topics.leave(topic, handle);
        self.transport.remove_from_group(handle, topic).await?;
        Ok(())
    }

    /// Publish an event to a topic group.
    ///
    /// The subscriber snapshot is taken for logging only; actual fan-out is
    /// the transport's group send. No index lock is held across that call.
    pub async fn publish_to_topic(
        &self,
        topic: &str,
        event: TrackingEvent,
    ) -> Result<usize, BrokerError> {
        let subscribers = self.topics.subscriber_count(topic);
        debug!(topic = %topic, subscribers, "Publishing");

        let delivered = self.transport.send_to_group(topic, &event).await?;
        if delivered == 0 && subscribers > 0 {
            warn!(topic = %topic, subscribers, "Group send reached no connections");
        }
        Ok(delivered)
    }

    /// Publish a caller's position to its own updates topic.
    ///
    /// The topic is named after the identity; coordinates pass through
    /// unvalidated.
    pub async fn publish_location_update(
        &self,
        identity: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<usize, BrokerError> {
        let event = LocationUpdate::new(identity, latitude, longitude).into_event();
        self.publish_to_topic(identity, event).await
    }

    /// Current handle for an identity, if connected.
    #[must_use]
    pub fn lookup(&self, identity: &str) -> Option<ConnectionId> {
        self.registry.lookup(identity)
    }

    /// Snapshot of a topic's subscribers.
    #[must_use]
    pub fn subscribers_of(&self, topic: &str) -> Vec<ConnectionId> {
        self.topics.subscribers_of(topic)
    }

    /// Index statistics, for metrics export.
    #[must_use]
    pub fn stats(&self) -> IndexStats {
        self.topics.stats()
    }

    /// Number of registered identities.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Stop the reaper, if one is running.
    pub async fn shutdown(&self) {
        let reaper = self.reaper.lock().unwrap().take();
        if let Some(reaper) = reaper {
            reaper.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    /// Records every group call; optionally fails group adds.
    #[derive(Default)]
    struct RecordingTransport {
        calls: StdMutex<Vec<String>>,
        groups: StdMutex<std::collections::HashMap<String, Vec<ConnectionId>>>,
        fail_adds: bool,
    }

    impl RecordingTransport {
        fn failing() -> Self {
            Self {
                fail_adds: true,
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn group(&self, name: &str) -> Vec<ConnectionId> {
            self.groups
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .unwrap_or_default()
        }
    }

    #[async_trait::async_trait]
    impl GroupTransport for RecordingTransport {
        async fn add_to_group(
            &self,
            handle: &ConnectionId,
            group: &str,
        ) -> Result<(), TransportError> {
            if self.fail_adds {
                return Err(TransportError::SendFailed("add refused".into()));
            }
            self.calls.lock().unwrap().push(format!("add:{group}:{handle}"));
            self.groups
                .lock()
                .unwrap()
                .entry(group.to_string())
                .or_default()
                .push(handle.clone());
            Ok(())
        }

        async fn remove_from_group(
            &self,
            handle: &ConnectionId,
            group: &str,
        ) -> Result<(), TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("remove:{group}:{handle}"));
            if let Some(members) = self.groups.lock().unwrap().get_mut(group) {
                members.retain(|h| h != handle);
            }
            Ok(())
        }

        async fn send_to_group(
            &self,
            group: &str,
            event: &TrackingEvent,
        ) -> Result<usize, TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("send:{group}:{}", event.payload));
            Ok(self.group(group).len())
        }
    }

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::new(id)
    }

    #[tokio::test]
    async fn test_publish_scenario() {
        let transport = Arc::new(RecordingTransport::default());
        let broker = TrackingBroker::new(transport.clone());

        broker.on_connect("idA", conn("connA"));
        broker.on_connect("idB", conn("connB"));
        broker.join_topic("order:42", &conn("connA")).await.unwrap();
        broker.join_topic("order:42", &conn("connB")).await.unwrap();

        let delivered = broker
            .publish_to_topic(
                "order:42",
                TrackingEvent::new("order:42", json!({"status": "OutForDelivery"})),
            )
            .await
            .unwrap();

        // One group send, both connections reachable.
        assert_eq!(delivered, 2);
        let sends: Vec<_> = transport
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("send:order:42"))
            .collect();
        assert_eq!(sends.len(), 1);

        // Disconnect A; only B remains subscribed.
        broker.on_disconnect("idA", &conn("connA"));
        assert_eq!(broker.subscribers_of("order:42"), vec![conn("connB")]);
        assert_eq!(broker.lookup("idA"), None);
    }

    #[tokio::test]
    async fn test_failed_group_add_records_nothing() {
        let transport = Arc::new(RecordingTransport::failing());
        let broker = TrackingBroker::new(transport);

        broker.on_connect("u1", conn("h1"));
        let result = broker.join_topic("order:1", &conn("h1")).await;

        assert!(result.is_err());
        // Transport add failed, so the index must not hold the entry.
        assert!(broker.subscribers_of("order:1").is_empty());
    }

    #[tokio::test]
    async fn test_leave_topic_tears_down_both_sides() {
        let transport = Arc::new(RecordingTransport::default());
        let broker = TrackingBroker::new(transport.clone());

        broker.join_topic("order:1", &conn("h1")).await.unwrap();
        broker.leave_topic("order:1", &conn("h1")).await.unwrap();

        assert!(broker.subscribers_of("order:1").is_empty());
        assert!(transport.group("order:1").is_empty());
        assert!(transport.calls().contains(&"remove:order:1:h1".to_string()));
    }

    #[tokio::test]
    async fn test_location_update_publishes_to_identity_topic() {
        let transport = Arc::new(RecordingTransport::default());
        let broker = TrackingBroker::new(transport.clone());

        broker.join_topic("courier:7", &conn("watcher")).await.unwrap();
        let delivered = broker
            .publish_location_update("courier:7", 52.52, 13.405)
            .await
            .unwrap();

        assert_eq!(delivered, 1);
        let sends: Vec<_> = transport
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("send:courier:7"))
            .collect();
        assert_eq!(sends.len(), 1);
        assert!(sends[0].contains("52.52"));
    }

    #[tokio::test]
    async fn test_reconnect_keeps_old_handle_subscriptions() {
        let transport = Arc::new(RecordingTransport::default());
        let broker = TrackingBroker::new(transport);

        broker.on_connect("u1", conn("h1"));
        broker.join_topic("order:1", &conn("h1")).await.unwrap();

        // Reconnect with a new handle: mapping moves, old subscriptions stay
        // until the old handle's own disconnect fires.
        broker.on_connect("u1", conn("h2"));
        assert_eq!(broker.lookup("u1"), Some(conn("h2")));
        assert_eq!(broker.subscribers_of("order:1"), vec![conn("h1")]);

        broker.on_disconnect("u1", &conn("h1"));
        assert!(broker.subscribers_of("order:1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_hook_receives_sweep_counts() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static SWEEPS: AtomicUsize = AtomicUsize::new(0);
        fn note_sweep(_removed: usize) {
            SWEEPS.fetch_add(1, Ordering::SeqCst);
        }

        let transport = Arc::new(RecordingTransport::default());
        let broker = TrackingBroker::start(
            transport,
            BrokerConfig {
                reap_interval: Duration::from_secs(60),
                on_reap: Some(note_sweep),
            },
        );

        // Let the spawned reaper start its interval before advancing time.
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        assert!(SWEEPS.load(Ordering::SeqCst) >= 1);

        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_broker_with_reaper_lifecycle() {
        let transport = Arc::new(RecordingTransport::default());
        let broker = TrackingBroker::start(transport, BrokerConfig::default());

        broker.on_connect("u1", conn("h1"));
        broker.join_topic("order:1", &conn("h1")).await.unwrap();
        assert_eq!(broker.stats().topic_count, 1);

        broker.shutdown().await;
    }
}
