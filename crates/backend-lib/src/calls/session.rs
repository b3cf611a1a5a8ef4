// ============================
// crates/backend-lib/src/calls/session.rs
// ============================
//! One-to-one call session record and its states.
use chrono::{DateTime, Utc};
use okean_common::{CallEndReason, CallId, CallKind, ConnectionId, UserSummary};
use uuid::Uuid;

/// Lifecycle of a one-to-one call.
///
/// `Calling` and `Ringing` are the same stored state seen from the two
/// ends: the caller is calling while the callee is ringing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Calling,
    Ringing,
    Connecting,
    Connected,
    Ended,
}

impl CallState {
    pub fn as_str(self) -> &'static str {
        match self {
            CallState::Calling => "calling",
            CallState::Ringing => "ringing",
            CallState::Connecting => "connecting",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
        }
    }

    /// Everything but `Ended` counts against the one-call-per-user rule
    pub fn is_live(self) -> bool {
        self != CallState::Ended
    }
}

/// Snapshot of a call between exactly two users
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: CallId,
    pub caller: UserSummary,
    pub callee: UserSummary,
    pub kind: CallKind,
    pub created_at: DateTime<Utc>,
    /// Connection that placed the call
    pub caller_connection: ConnectionId,
    /// Connection that accepted the call, once accepted
    pub callee_connection: Option<ConnectionId>,
    /// Set once the session has ended
    pub end_reason: Option<CallEndReason>,
    pub(crate) state: CallState,
}

impl CallSession {
    pub(crate) fn new(
        caller: UserSummary,
        caller_connection: ConnectionId,
        callee: UserSummary,
        kind: CallKind,
    ) -> Self {
        Self {
            call_id: Uuid::new_v4(),
            caller,
            callee,
            kind,
            created_at: Utc::now(),
            caller_connection,
            callee_connection: None,
            end_reason: None,
            state: CallState::Ringing,
        }
    }

    /// Stored state (the callee's view while ringing)
    pub fn state(&self) -> CallState {
        self.state
    }

    /// State as seen by `user_id`
    pub fn state_for(&self, user_id: &str) -> CallState {
        if self.state == CallState::Ringing && self.caller.id == user_id {
            CallState::Calling
        } else {
            self.state
        }
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.caller.id == user_id || self.callee.id == user_id
    }

    /// True when the session is between exactly these two users, in either
    /// direction
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.caller.id == a && self.callee.id == b) || (self.caller.id == b && self.callee.id == a)
    }

    /// The party that is not `user_id`
    pub fn other_party(&self, user_id: &str) -> &UserSummary {
        if self.caller.id == user_id {
            &self.callee
        } else {
            &self.caller
        }
    }

    /// Connection bound to a party for this call, if known
    pub fn connection_of(&self, user_id: &str) -> Option<ConnectionId> {
        if self.caller.id == user_id {
            Some(self.caller_connection)
        } else if self.callee.id == user_id {
            self.callee_connection
        } else {
            None
        }
    }
}
