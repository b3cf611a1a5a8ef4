// ============================
// crates/backend-lib/src/presence.rs
// ============================
//! Online/offline announcements.
//!
//! Only presence edges are announced: the first connection of a user and
//! the loss of their last one. The audience is everyone sharing a group with
//! the user plus their friends (or every online user, depending on scope),
//! never the user's own connections.
//!
//! Callers take the user's turn with [`PresenceNotifier::lock_user`] before
//! touching the registry and keep it until the announcement is queued. A
//! quick reconnect therefore cannot overtake the offline announcement of
//! the connection it replaces.
use dashmap::DashMap;
use metrics::gauge;
use okean_common::{ConnectionId, GroupName, ServerMessage, UserId, UserSummary};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::config::PresenceScope;
use crate::directory::RelationshipStore;
use crate::groups::GroupMembership;
use crate::outbox::Outbox;
use crate::registry::ConnectionRegistry;

pub struct PresenceNotifier {
    registry: Arc<ConnectionRegistry>,
    groups: Arc<GroupMembership>,
    outbox: Arc<Outbox>,
    relationships: Arc<dyn RelationshipStore>,
    scope: PresenceScope,
    turns: DashMap<UserId, Arc<Mutex<()>>>,
}

impl PresenceNotifier {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        groups: Arc<GroupMembership>,
        outbox: Arc<Outbox>,
        relationships: Arc<dyn RelationshipStore>,
        scope: PresenceScope,
    ) -> Self {
        Self {
            registry,
            groups,
            outbox,
            relationships,
            scope,
            turns: DashMap::new(),
        }
    }

    /// Wait for exclusive use of `user_id`'s presence. Hold the guard from
    /// the registry mutation until the matching announcement is queued.
    pub async fn lock_user(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let turn = self.turns.entry(user_id.to_string()).or_default().clone();
        turn.lock_owned().await
    }

    /// Drop the user's lock once nobody holds or waits for it
    pub fn forget_user(&self, user_id: &str) {
        self.turns
            .remove_if(user_id, |_, turn| Arc::strong_count(turn) == 1);
    }

    /// Users with a presence lock entry
    pub fn tracked_users(&self) -> usize {
        self.turns.len()
    }

    /// Announce that `user` came online. `groups` are the groups their
    /// first connection occupies.
    pub async fn announce_online(&self, user: &UserSummary, groups: &HashSet<GroupName>) {
        gauge!(crate::metrics::USERS_ONLINE).set(self.registry.online_count() as f64);
        let audience = self.audience(&user.id, groups).await;
        debug!(user_id = %user.id, recipients = audience.len(), "user came online");

        let event = ServerMessage::UserCameOnline { user: user.clone() };
        self.outbox.send_to_many(audience.iter(), None, &event);
    }

    /// Announce that `user` went offline. `groups` are the groups their
    /// last connection occupied before it was dropped.
    pub async fn announce_offline(&self, user: &UserSummary, groups: &HashSet<GroupName>) {
        gauge!(crate::metrics::USERS_ONLINE).set(self.registry.online_count() as f64);
        let audience = self.audience(&user.id, groups).await;
        debug!(user_id = %user.id, recipients = audience.len(), "user went offline");

        let event = ServerMessage::UserWentOffline {
            user_id: user.id.clone(),
        };
        self.outbox.send_to_many(audience.iter(), None, &event);
    }

    async fn audience(&self, user_id: &str, groups: &HashSet<GroupName>) -> HashSet<ConnectionId> {
        let mut audience: HashSet<ConnectionId> = groups
            .iter()
            .flat_map(|group| self.groups.members_of(group))
            .collect();

        let interested = match self.scope {
            PresenceScope::Everyone => self.registry.all_online_user_ids(),
            PresenceScope::Friends => match self.relationships.friends_of(user_id).await {
                Ok(friends) => friends,
                Err(err) => {
                    warn!(user_id, error = %err, "could not load friends for presence");
                    HashSet::new()
                },
            },
        };
        for other in interested.iter().filter(|other| other.as_str() != user_id) {
            audience.extend(self.registry.connections_of(other));
        }

        for own in self.registry.connections_of(user_id) {
            audience.remove(&own);
        }
        audience
    }
}
