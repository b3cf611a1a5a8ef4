// ============================
// crates/backend-lib/src/groups.rs
// ============================
//! Group membership bookkeeping.
//!
//! The forward index (group → connections) drives fan-out, the reverse
//! index (connection → groups) drives disconnect cleanup. Both live behind
//! one lock so every join/leave mutates them together. Nothing here sends
//! notifications; callers decide what to announce.
use okean_common::{ConnectionId, GroupName};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
struct Indices {
    forward: HashMap<GroupName, HashSet<ConnectionId>>,
    reverse: HashMap<ConnectionId, HashSet<GroupName>>,
}

/// Many-to-many relation between connections and broadcast groups
#[derive(Default)]
pub struct GroupMembership {
    indices: RwLock<Indices>,
}

impl GroupMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the connection was not already a member
    pub fn join(&self, connection_id: ConnectionId, group: &str) -> bool {
        let mut indices = self.indices.write();
        let added = indices
            .forward
            .entry(group.to_string())
            .or_default()
            .insert(connection_id);
        if added {
            indices
                .reverse
                .entry(connection_id)
                .or_default()
                .insert(group.to_string());
        }
        added
    }

    /// Returns true if the connection was a member. Leaving a group that was
    /// never joined is a no-op.
    pub fn leave(&self, connection_id: ConnectionId, group: &str) -> bool {
        let mut indices = self.indices.write();
        let removed = match indices.forward.get_mut(group) {
            Some(members) => {
                let removed = members.remove(&connection_id);
                if members.is_empty() {
                    indices.forward.remove(group);
                }
                removed
            },
            None => false,
        };
        if removed {
            if let Some(groups) = indices.reverse.get_mut(&connection_id) {
                groups.remove(group);
                if groups.is_empty() {
                    indices.reverse.remove(&connection_id);
                }
            }
        }
        removed
    }

    /// Drop a connection from every group, returning the groups it was in
    pub fn leave_all(&self, connection_id: ConnectionId) -> HashSet<GroupName> {
        let mut indices = self.indices.write();
        let groups = indices.reverse.remove(&connection_id).unwrap_or_default();
        for group in &groups {
            if let Some(members) = indices.forward.get_mut(group) {
                members.remove(&connection_id);
                if members.is_empty() {
                    indices.forward.remove(group);
                }
            }
        }
        groups
    }

    pub fn members_of(&self, group: &str) -> HashSet<ConnectionId> {
        self.indices
            .read()
            .forward
            .get(group)
            .cloned()
            .unwrap_or_default()
    }

    pub fn groups_of(&self, connection_id: ConnectionId) -> HashSet<GroupName> {
        self.indices
            .read()
            .reverse
            .get(&connection_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_member(&self, connection_id: ConnectionId, group: &str) -> bool {
        self.indices
            .read()
            .forward
            .get(group)
            .is_some_and(|members| members.contains(&connection_id))
    }

    pub fn group_count(&self) -> usize {
        self.indices.read().forward.len()
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let indices = self.indices.read();
        for (group, members) in &indices.forward {
            assert!(!members.is_empty(), "empty group {group} left behind");
            for connection in members {
                assert!(indices.reverse[connection].contains(group));
            }
        }
        for (connection, groups) in &indices.reverse {
            assert!(!groups.is_empty());
            for group in groups {
                assert!(indices.forward[group].contains(connection));
            }
        }
    }
}
