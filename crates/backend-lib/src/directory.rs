// ============================
// crates/backend-lib/src/directory.rs
// ============================
//! Identity and relationship collaborators.
//!
//! The relay never owns user accounts or friendships; it asks these traits.
//! `StaticDirectory` backs both from configuration and is good enough for a
//! single node or for tests.
use async_trait::async_trait;
use dashmap::DashMap;
use okean_common::{UserId, UserSummary};
use std::collections::HashSet;

use crate::config::Settings;
use crate::error::AppError;

/// Maps connection credentials to users
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve a bearer token. `Ok(None)` means the token is unknown.
    async fn resolve(&self, token: &str) -> Result<Option<UserSummary>, AppError>;

    /// Look up a user's public profile
    async fn profile(&self, user_id: &str) -> Result<Option<UserSummary>, AppError>;
}

/// Accepted friendships between users
#[async_trait]
pub trait RelationshipStore: Send + Sync {
    async fn are_friends(&self, a: &str, b: &str) -> Result<bool, AppError>;

    async fn friends_of(&self, user_id: &str) -> Result<HashSet<UserId>, AppError>;
}

/// In-memory directory seeded from settings
#[derive(Default)]
pub struct StaticDirectory {
    tokens: DashMap<String, UserId>,
    profiles: DashMap<UserId, UserSummary>,
    friends: DashMap<UserId, HashSet<UserId>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let directory = Self::new();
        for seed in &settings.users {
            let mut user = UserSummary::new(seed.id.clone(), seed.display_name.clone());
            user.avatar_ref = seed.avatar_ref.clone();
            directory.add_user(&seed.token, user);
        }
        for (a, b) in &settings.friendships {
            directory.add_friendship(a, b);
        }
        directory
    }

    pub fn add_user(&self, token: &str, user: UserSummary) {
        self.tokens.insert(token.to_string(), user.id.clone());
        self.profiles.insert(user.id.clone(), user);
    }

    /// Friendship is symmetric
    pub fn add_friendship(&self, a: &str, b: &str) {
        self.friends.entry(a.to_string()).or_default().insert(b.to_string());
        self.friends.entry(b.to_string()).or_default().insert(a.to_string());
    }

    pub fn remove_friendship(&self, a: &str, b: &str) {
        if let Some(mut friends) = self.friends.get_mut(a) {
            friends.remove(b);
        }
        if let Some(mut friends) = self.friends.get_mut(b) {
            friends.remove(a);
        }
    }
}

#[async_trait]
impl IdentityResolver for StaticDirectory {
    async fn resolve(&self, token: &str) -> Result<Option<UserSummary>, AppError> {
        let Some(user_id) = self.tokens.get(token).map(|id| id.value().clone()) else {
            return Ok(None);
        };
        Ok(self.profiles.get(&user_id).map(|user| user.value().clone()))
    }

    async fn profile(&self, user_id: &str) -> Result<Option<UserSummary>, AppError> {
        Ok(self.profiles.get(user_id).map(|user| user.value().clone()))
    }
}

#[async_trait]
impl RelationshipStore for StaticDirectory {
    async fn are_friends(&self, a: &str, b: &str) -> Result<bool, AppError> {
        Ok(self
            .friends
            .get(a)
            .is_some_and(|friends| friends.contains(b)))
    }

    async fn friends_of(&self, user_id: &str) -> Result<HashSet<UserId>, AppError> {
        Ok(self
            .friends
            .get(user_id)
            .map(|friends| friends.value().clone())
            .unwrap_or_default())
    }
}
