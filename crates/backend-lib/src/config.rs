// ============================
// crates/backend-lib/src/config.rs
// ============================
//! Configuration management.
use anyhow::{bail, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use okean_common::UserId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::validation::validate_user_id;

/// Config file read when no explicit path is given
pub const DEFAULT_CONFIG_FILE: &str = "okean.toml";
/// Prefix of environment overrides; `__` separates nested keys
pub const ENV_PREFIX: &str = "OKEAN_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Data directory path
    pub data_dir: PathBuf,
    /// Log level
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    pub call: CallSettings,
    pub presence: PresenceSettings,
    pub connection: ConnectionSettings,
    /// Users known to the built-in directory
    pub users: Vec<UserSeed>,
    /// Accepted friendships, as user id pairs
    pub friendships: Vec<(UserId, UserId)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallSettings {
    /// How long an unanswered call rings before it is ended
    pub ring_timeout_secs: u64,
    /// Only friends may call each other
    pub require_friendship: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceSettings {
    pub scope: PresenceScope,
}

/// Who besides group peers hears about online/offline transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceScope {
    Friends,
    Everyone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Capacity of each connection's outbound queue
    pub outbound_buffer: usize,
    /// Largest accepted signaling payload
    pub max_payload_bytes: usize,
    pub max_commands_per_window: u32,
    pub rate_window_secs: u64,
}

/// A user entry for the built-in directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSeed {
    /// Bearer token presented on connect
    pub token: String,
    pub id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 3000)),
            data_dir: PathBuf::from("data"),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            call: CallSettings::default(),
            presence: PresenceSettings::default(),
            connection: ConnectionSettings::default(),
            users: Vec::new(),
            friendships: Vec::new(),
        }
    }
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 60,
            require_friendship: true,
        }
    }
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            scope: PresenceScope::Friends,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            outbound_buffer: 64,
            max_payload_bytes: 64 * 1024,
            max_commands_per_window: 120,
            rate_window_secs: 10,
        }
    }
}

impl Settings {
    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            bail!("Unknown log level '{}'", self.log_level);
        }
        if self.call.ring_timeout_secs == 0 {
            bail!("call.ring_timeout_secs must be greater than zero");
        }
        if self.connection.outbound_buffer == 0 {
            bail!("connection.outbound_buffer must be greater than zero");
        }
        if self.connection.max_payload_bytes == 0 {
            bail!("connection.max_payload_bytes must be greater than zero");
        }
        if self.connection.max_commands_per_window == 0 || self.connection.rate_window_secs == 0 {
            bail!("connection rate limit window and budget must be greater than zero");
        }

        let mut tokens = HashSet::new();
        let mut ids = HashSet::new();
        for user in &self.users {
            validate_user_id(&user.id)?;
            if user.token.is_empty() {
                bail!("User '{}' has an empty token", user.id);
            }
            if !tokens.insert(user.token.as_str()) {
                bail!("Duplicate token for user '{}'", user.id);
            }
            if !ids.insert(user.id.as_str()) {
                bail!("Duplicate user id '{}'", user.id);
            }
        }
        for (a, b) in &self.friendships {
            if a == b {
                bail!("User '{a}' cannot befriend themselves");
            }
        }
        Ok(())
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.call.ring_timeout_secs)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.connection.rate_window_secs)
    }
}

/// Load settings: defaults, then the TOML file, then `OKEAN_*` variables
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
        .merge(Toml::file(file))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()?;

    settings.validate()?;
    Ok(settings)
}
