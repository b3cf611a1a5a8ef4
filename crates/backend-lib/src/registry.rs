// ============================
// crates/backend-lib/src/registry.rs
// ============================
//! Connection registry: which live connections belong to which user.
//!
//! A user is online iff this registry holds a non-empty connection set for
//! them. Adding and removing report the presence edge they caused, computed
//! under the same shard lock as the mutation, so concurrent connects and
//! disconnects for one user can never both observe the same transition.
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use okean_common::{ConnectionId, UserId};
use std::collections::HashSet;

/// Presence edge produced by a registry mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEdge {
    /// The user had no connections before this add
    CameOnline,
    /// The removed connection was the user's last one
    WentOffline,
    /// Presence did not change
    Unchanged,
}

/// Thread-safe user → connections map
#[derive(Default)]
pub struct ConnectionRegistry {
    users: DashMap<UserId, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection for a user. Adding the same connection twice is a
    /// no-op that reports `Unchanged`.
    pub fn add_connection(&self, user_id: &str, connection_id: ConnectionId) -> PresenceEdge {
        match self.users.entry(user_id.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().insert(connection_id);
                PresenceEdge::Unchanged
            },
            Entry::Vacant(entry) => {
                entry.insert(HashSet::from([connection_id]));
                PresenceEdge::CameOnline
            },
        }
    }

    /// Remove a connection. When the set empties the user entry is dropped
    /// entirely, which is what makes the user offline.
    pub fn remove_connection(&self, user_id: &str, connection_id: ConnectionId) -> PresenceEdge {
        match self.users.entry(user_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get_mut().remove(&connection_id) {
                    return PresenceEdge::Unchanged;
                }
                if entry.get().is_empty() {
                    entry.remove();
                    PresenceEdge::WentOffline
                } else {
                    PresenceEdge::Unchanged
                }
            },
            Entry::Vacant(_) => PresenceEdge::Unchanged,
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.users
            .get(user_id)
            .is_some_and(|connections| !connections.is_empty())
    }

    /// Connections of a user; empty when the user is unknown
    pub fn connections_of(&self, user_id: &str) -> HashSet<ConnectionId> {
        self.users
            .get(user_id)
            .map(|connections| connections.value().clone())
            .unwrap_or_default()
    }

    /// True if `connection_id` is registered to `user_id`
    pub fn owns(&self, user_id: &str, connection_id: ConnectionId) -> bool {
        self.users
            .get(user_id)
            .is_some_and(|connections| connections.contains(&connection_id))
    }

    pub fn all_online_user_ids(&self) -> HashSet<UserId> {
        self.users.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn online_count(&self) -> usize {
        self.users.len()
    }
}
