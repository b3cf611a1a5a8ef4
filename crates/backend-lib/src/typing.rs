// ============================
// crates/backend-lib/src/typing.rs
// ============================
//! Typing indicators, tracked per (connection, group).
use dashmap::DashMap;
use okean_common::{ConnectionId, GroupName};
use std::collections::HashSet;

#[derive(Default)]
pub struct TypingTracker {
    typing: DashMap<ConnectionId, HashSet<GroupName>>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the connection was not already typing in the group
    pub fn start(&self, connection_id: ConnectionId, group: &str) -> bool {
        self.typing
            .entry(connection_id)
            .or_default()
            .insert(group.to_string())
    }

    /// Returns true if the connection was typing in the group
    pub fn stop(&self, connection_id: ConnectionId, group: &str) -> bool {
        let Some(mut groups) = self.typing.get_mut(&connection_id) else {
            return false;
        };
        let removed = groups.remove(group);
        let now_empty = groups.is_empty();
        drop(groups);
        if now_empty {
            self.typing.remove_if(&connection_id, |_, groups| groups.is_empty());
        }
        removed
    }

    /// Forget the connection, returning the groups it was typing in
    pub fn clear(&self, connection_id: ConnectionId) -> HashSet<GroupName> {
        self.typing
            .remove(&connection_id)
            .map(|(_, groups)| groups)
            .unwrap_or_default()
    }

    pub fn is_typing(&self, connection_id: ConnectionId, group: &str) -> bool {
        self.typing
            .get(&connection_id)
            .is_some_and(|groups| groups.contains(group))
    }
}
