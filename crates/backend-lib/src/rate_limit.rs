// ============================
// crates/backend-lib/src/rate_limit.rs
// ============================
//! Fixed-window command rate limiting per connection.
use dashmap::DashMap;
use okean_common::ConnectionId;
use std::time::{Duration, Instant};

use crate::error::AppError;

/// Rate limit entry for a connection
#[derive(Debug)]
struct RateLimitEntry {
    commands: u32,
    window_start: Instant,
}

/// Per-connection command budget
#[derive(Debug)]
pub struct RateLimiter {
    entries: DashMap<ConnectionId, RateLimitEntry>,
    max_commands: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(window: Duration, max_commands: u32) -> Self {
        Self {
            entries: DashMap::new(),
            max_commands,
            window,
        }
    }

    /// Count one command against the connection's current window
    pub fn check(&self, connection_id: ConnectionId) -> Result<(), AppError> {
        let now = Instant::now();
        let mut entry = self.entries.entry(connection_id).or_insert_with(|| RateLimitEntry {
            commands: 0,
            window_start: now,
        });

        // Check if window has expired
        if now.duration_since(entry.window_start) >= self.window {
            entry.commands = 0;
            entry.window_start = now;
        }

        if entry.commands >= self.max_commands {
            return Err(AppError::RateLimitExceeded);
        }
        entry.commands += 1;
        Ok(())
    }

    /// Drop the entry of a closed connection
    pub fn forget(&self, connection_id: ConnectionId) {
        self.entries.remove(&connection_id);
    }

    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}
