//! Topic subscription index.
//!
//! Maps a topic key (an order, restaurant, or courier id) to the set of
//! connection handles subscribed to it. Topics are created implicitly on
//! first join and removed eagerly when their subscriber set drains; the
//! reaper sweeps up anything a race leaves behind.

use crate::connection::ConnectionId;
use dashmap::DashMap;
use std::collections::HashSet;
use tracing::{debug, trace};

/// Topic to subscriber-set index.
///
/// Subscriber sets are proper sets: joining twice is the same as joining
/// once, and emptiness checks are exact. Per-topic mutations lock only the
/// topic's shard, so different topics never contend.
#[derive(Debug, Default)]
pub struct TopicSubscriptionIndex {
    topics: DashMap<String, HashSet<ConnectionId>>,
}

impl TopicSubscriptionIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handle to a topic's subscriber set, creating the topic if
    /// absent.
    ///
    /// Returns `true` if the handle was newly added, `false` if it was
    /// already a member.
    pub fn join(&self, topic: &str, handle: ConnectionId) -> bool {
        let mut subscribers = self.topics.entry(topic.to_string()).or_default();
        let added = subscribers.insert(handle.clone());
        if added {
            debug!(
                topic = %topic,
                connection = %handle,
                subscribers = subscribers.len(),
                "Joined topic"
            );
        }
        added
    }

    /// Remove a handle from a topic.
    ///
    /// Removing a handle that is not a member (or from an unknown topic) is
    /// a no-op. A topic left empty is removed eagerly; the removal is a
    /// compare-and-remove, so a handle joining concurrently is never
    /// dropped and no phantom empty entry survives.
    ///
    /// Returns `true` if the handle was a member.
    pub fn leave(&self, topic: &str, handle: &ConnectionId) -> bool {
        let removed = match self.topics.get_mut(topic) {
            Some(mut subscribers) => subscribers.remove(handle),
            None => false,
        };

        if removed {
            debug!(topic = %topic, connection = %handle, "Left topic");
            // Only delete if still empty at removal time; the predicate runs
            // under the entry's write lock.
            if self.topics.remove_if(topic, |_, s| s.is_empty()).is_some() {
                debug!(topic = %topic, "Removed empty topic");
            }
        }
        removed
    }

    /// Remove a handle from every topic it is subscribed to.
    ///
    /// Full scan over all topics. This only runs on disconnect, never on
    /// the publish path. Returns the number of topics the handle was
    /// removed from.
    pub fn purge_connection(&self, handle: &ConnectionId) -> usize {
        let mut touched = Vec::new();
        for mut entry in self.topics.iter_mut() {
            if entry.value_mut().remove(handle) {
                touched.push(entry.key().clone());
            }
        }

        for topic in &touched {
            self.topics.remove_if(topic, |_, s| s.is_empty());
        }

        if !touched.is_empty() {
            debug!(connection = %handle, topics = touched.len(), "Purged connection");
        }
        touched.len()
    }

    /// Remove all currently-empty topic entries.
    ///
    /// Idempotent and safe to run concurrently with join/leave: a topic
    /// that gained a subscriber between the emptiness check and the removal
    /// is left alone. Returns the number of topics removed.
    pub fn sweep_empty(&self) -> usize {
        let candidates: Vec<String> = self
            .topics
            .iter()
            .filter(|entry| entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for topic in candidates {
            if self.topics.remove_if(&topic, |_, s| s.is_empty()).is_some() {
                trace!(topic = %topic, "Swept empty topic");
                removed += 1;
            }
        }
        removed
    }

    /// Read-only snapshot of a topic's subscribers.
    ///
    /// Returns an empty vec for an unknown topic.
    #[must_use]
    pub fn subscribers_of(&self, topic: &str) -> Vec<ConnectionId> {
        self.topics
            .get(topic)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Check if a topic currently exists.
    #[must_use]
    pub fn contains_topic(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Subscriber count for a topic (0 for unknown).
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    /// Number of live topics.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// All topic names.
    #[must_use]
    pub fn topic_names(&self) -> Vec<String> {
        self.topics.iter().map(|e| e.key().clone()).collect()
    }

    /// Index statistics.
    #[must_use]
    pub fn stats(&self) -> IndexStats {
        IndexStats {
            topic_count: self.topics.len(),
            total_subscriptions: self.topics.iter().map(|e| e.value().len()).sum(),
        }
    }
}

/// Subscription index statistics.
#[derive(Debug, Clone)]
pub struct IndexStats {
    /// Number of live topics.
    pub topic_count: usize,
    /// Total subscriptions across all topics.
    pub total_subscriptions: usize,
}
