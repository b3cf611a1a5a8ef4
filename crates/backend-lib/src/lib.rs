// ============================
// okean-backend-lib/src/lib.rs
// ============================
//! Core backend-lib functionality for the Okean presence and signaling server.

pub mod calls;
pub mod config;
pub mod directory;
pub mod error;
pub mod groups;
pub mod metrics;
pub mod outbox;
pub mod presence;
pub mod rate_limit;
pub mod registry;
pub mod relay;
pub mod rooms;
pub mod storage;
pub mod typing;
pub mod validation;
pub mod websocket;
pub mod ws_router;

use std::sync::Arc;

use crate::config::Settings;
use crate::directory::{IdentityResolver, RelationshipStore, StaticDirectory};
use crate::rate_limit::RateLimiter;
use crate::relay::{RelayOptions, SignalingRelay};
use crate::storage::{FlatFileStorage, MessageStore};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Routes every client command
    pub relay: Arc<SignalingRelay>,
    /// Resolves connect tokens
    pub identity: Arc<dyn IdentityResolver>,
    /// Settings the server was started with
    pub settings: Arc<Settings>,
    /// Per-connection command budget
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Create the application state with the built-in directory and the
    /// flat-file message store under `settings.data_dir`
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        let directory = Arc::new(StaticDirectory::from_settings(&settings));
        let storage = Arc::new(FlatFileStorage::new(&settings.data_dir)?);
        Ok(Self::with_collaborators(
            settings,
            directory.clone(),
            directory,
            storage,
        ))
    }

    /// Create the application state around externally provided collaborators
    pub fn with_collaborators(
        settings: Settings,
        identity: Arc<dyn IdentityResolver>,
        relationships: Arc<dyn RelationshipStore>,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        let relay = SignalingRelay::new(
            identity.clone(),
            relationships,
            messages,
            RelayOptions::from(&settings),
        );
        let rate_limiter = RateLimiter::new(
            settings.rate_window(),
            settings.connection.max_commands_per_window,
        );

        Self {
            relay: Arc::new(relay),
            identity,
            settings: Arc::new(settings),
            rate_limiter: Arc::new(rate_limiter),
        }
    }
}
