//! Connection registry.
//!
//! Maps a caller identity to its current connection handle. A caller may
//! reconnect at any time; the registry keeps at most one handle per identity
//! and the last write wins.

use crate::connection::{ConnectionId, Identity};
use dashmap::DashMap;
use tracing::debug;

/// Identity to connection-handle map.
///
/// All operations are atomic as a whole and safe under arbitrary concurrent
/// callers. Registering an identity that already exists silently replaces
/// the stored handle; the previous connection's topic memberships are left
/// untouched and are cleaned up by its own disconnect (or by the reaper once
/// its topics drain).
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<Identity, ConnectionId>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for an identity. Last write wins.
    pub fn register(&self, identity: impl Into<Identity>, handle: ConnectionId) {
        let identity = identity.into();
        let previous = self.connections.insert(identity.clone(), handle.clone());
        match previous {
            Some(old) => {
                debug!(identity = %identity, old = %old, new = %handle, "Connection replaced")
            }
            None => debug!(identity = %identity, connection = %handle, "Connection registered"),
        }
    }

    /// Remove the mapping for an identity.
    ///
    /// Returns the handle that was registered, if any. Unregistering an
    /// absent identity is a no-op, never an error.
    pub fn unregister(&self, identity: &str) -> Option<ConnectionId> {
        let removed = self.connections.remove(identity).map(|(_, handle)| handle);
        if let Some(handle) = &removed {
            debug!(identity = %identity, connection = %handle, "Connection unregistered");
        }
        removed
    }

    /// Look up the current handle for an identity.
    #[must_use]
    pub fn lookup(&self, identity: &str) -> Option<ConnectionId> {
        self.connections.get(identity).map(|h| h.value().clone())
    }

    /// Number of registered identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check whether any identity is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
