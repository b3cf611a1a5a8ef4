// ============================
// crates/backend-lib/src/calls/mod.rs
// ============================
//! One-to-one call state machine.
//!
//! All sessions live in one table guarded by a single mutex, so compound
//! check-then-act steps ("is anyone busy? then register") are atomic and two
//! racing `initiate` calls between the same pair can never both succeed.
//! The lock is never held across an `.await`.
mod session;

pub use session::{CallSession, CallState};

use crate::error::AppError;
use metrics::{counter, gauge};
use okean_common::{CallEndReason, CallId, CallKind, ConnectionId, UserId, UserSummary};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::task::AbortHandle;
use tracing::debug;

struct Slot {
    session: CallSession,
    ring_timer: Option<AbortHandle>,
}

#[derive(Default)]
struct CallTable {
    sessions: HashMap<CallId, Slot>,
    by_user: HashMap<UserId, CallId>,
}

impl CallTable {
    fn live_call_of(&self, user_id: &str) -> Option<&Slot> {
        self.by_user
            .get(user_id)
            .and_then(|call_id| self.sessions.get(call_id))
    }

    /// Remove a session, cancelling its ring timer. The returned snapshot
    /// is in `Ended`.
    fn finish(&mut self, call_id: CallId, reason: CallEndReason) -> Option<CallSession> {
        let slot = self.sessions.remove(&call_id)?;
        if let Some(timer) = slot.ring_timer {
            timer.abort();
        }
        let mut session = slot.session;
        self.by_user.remove(&session.caller.id);
        self.by_user.remove(&session.callee.id);
        session.state = CallState::Ended;
        session.end_reason = Some(reason);

        counter!(crate::metrics::CALLS_ENDED, "reason" => reason.as_str()).increment(1);
        gauge!(crate::metrics::CALLS_ACTIVE).set(self.sessions.len() as f64);
        debug!(call_id = %call_id, reason = reason.as_str(), "call ended");
        Some(session)
    }
}

/// Registry of live one-to-one calls
#[derive(Default)]
pub struct CallManager {
    table: Mutex<CallTable>,
}

impl CallManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a call. Both closures are evaluated inside the critical
    /// section: `caller_registered` first, so a caller that disconnected
    /// meanwhile is refused, then `callee_reachable` after the caller busy
    /// check and before the callee busy check.
    pub fn initiate(
        &self,
        caller: &UserSummary,
        caller_connection: ConnectionId,
        callee: &UserSummary,
        kind: CallKind,
        caller_registered: impl FnOnce() -> bool,
        callee_reachable: impl FnOnce() -> bool,
    ) -> Result<CallSession, AppError> {
        if caller.id == callee.id {
            return Err(AppError::InvalidArgument("Cannot call yourself".to_string()));
        }

        let mut table = self.table.lock();
        if !caller_registered() {
            return Err(AppError::Unauthorized(
                "connection is not registered".to_string(),
            ));
        }
        if table.by_user.contains_key(&caller.id) {
            return Err(AppError::CallConflict);
        }
        if !callee_reachable() {
            return Err(AppError::TargetUnreachable);
        }
        if table.by_user.contains_key(&callee.id) {
            return Err(AppError::TargetBusy);
        }

        let session = CallSession::new(caller.clone(), caller_connection, callee.clone(), kind);
        table.by_user.insert(caller.id.clone(), session.call_id);
        table.by_user.insert(callee.id.clone(), session.call_id);
        table.sessions.insert(
            session.call_id,
            Slot {
                session: session.clone(),
                ring_timer: None,
            },
        );

        counter!(crate::metrics::CALLS_STARTED).increment(1);
        gauge!(crate::metrics::CALLS_ACTIVE).set(table.sessions.len() as f64);
        Ok(session)
    }

    /// Attach the ring timeout task to a pending session. If the session
    /// already left `Ringing` the timer is cancelled on the spot.
    pub fn attach_ring_timer(&self, call_id: CallId, timer: AbortHandle) {
        let mut table = self.table.lock();
        match table.sessions.get_mut(&call_id) {
            Some(slot) if slot.session.state == CallState::Ringing => {
                slot.ring_timer = Some(timer);
            },
            _ => timer.abort(),
        }
    }

    /// Callee answers: Ringing → Connecting
    pub fn accept(
        &self,
        callee_id: &str,
        call_id: CallId,
        callee_connection: ConnectionId,
    ) -> Result<CallSession, AppError> {
        let mut table = self.table.lock();
        let slot = table
            .sessions
            .get_mut(&call_id)
            .filter(|slot| slot.session.callee.id == callee_id)
            .ok_or(AppError::CallNotFound)?;

        if slot.session.state != CallState::Ringing {
            return Err(AppError::InvalidTransition {
                action: "accept",
                state: slot.session.state.as_str(),
            });
        }
        if let Some(timer) = slot.ring_timer.take() {
            timer.abort();
        }
        slot.session.state = CallState::Connecting;
        slot.session.callee_connection = Some(callee_connection);
        Ok(slot.session.clone())
    }

    /// Callee declines a ringing call
    pub fn reject(&self, callee_id: &str, call_id: CallId) -> Result<CallSession, AppError> {
        self.end_unanswered(call_id, "reject", CallEndReason::Rejected, |session| {
            session.callee.id == callee_id
        })
    }

    /// Caller withdraws a ringing call
    pub fn cancel(&self, caller_id: &str, call_id: CallId) -> Result<CallSession, AppError> {
        self.end_unanswered(call_id, "cancel", CallEndReason::Cancelled, |session| {
            session.caller.id == caller_id
        })
    }

    fn end_unanswered(
        &self,
        call_id: CallId,
        action: &'static str,
        reason: CallEndReason,
        is_party: impl Fn(&CallSession) -> bool,
    ) -> Result<CallSession, AppError> {
        let mut table = self.table.lock();
        let slot = table
            .sessions
            .get(&call_id)
            .filter(|slot| is_party(&slot.session))
            .ok_or(AppError::CallNotFound)?;

        if slot.session.state != CallState::Ringing {
            return Err(AppError::InvalidTransition {
                action,
                state: slot.session.state.as_str(),
            });
        }
        table.finish(call_id, reason).ok_or(AppError::CallNotFound)
    }

    /// Either party hangs up a live call by id
    pub fn end_call(&self, party_id: &str, call_id: CallId) -> Result<CallSession, AppError> {
        let mut table = self.table.lock();
        let reason = match table.sessions.get(&call_id) {
            Some(slot) if slot.session.involves(party_id) => hang_up_reason(&slot.session, party_id),
            _ => return Err(AppError::CallNotFound),
        };
        table.finish(call_id, reason).ok_or(AppError::CallNotFound)
    }

    /// Either party hangs up whatever live call it has with `other_id`
    pub fn end_between(&self, party_id: &str, other_id: &str) -> Result<CallSession, AppError> {
        let mut table = self.table.lock();
        let (call_id, reason) = match table.live_call_of(party_id) {
            Some(slot) if slot.session.is_between(party_id, other_id) => (
                slot.session.call_id,
                hang_up_reason(&slot.session, party_id),
            ),
            _ => return Err(AppError::CallNotFound),
        };
        table.finish(call_id, reason).ok_or(AppError::CallNotFound)
    }

    /// Authorize a signaling payload from `from_id` to `to_id`: allowed only
    /// while a live session exists between them.
    pub fn authorize_signal(&self, from_id: &str, to_id: &str) -> Result<CallSession, AppError> {
        let table = self.table.lock();
        table
            .live_call_of(from_id)
            .filter(|slot| slot.session.is_between(from_id, to_id))
            .map(|slot| slot.session.clone())
            .ok_or(AppError::CallNotFound)
    }

    /// An answer reached the peer: Connecting → Connected. Returns true if
    /// the state changed.
    pub fn mark_connected(&self, call_id: CallId) -> bool {
        let mut table = self.table.lock();
        match table.sessions.get_mut(&call_id) {
            Some(slot) if slot.session.state == CallState::Connecting => {
                slot.session.state = CallState::Connected;
                true
            },
            _ => false,
        }
    }

    /// Force-end the live call of a user who lost every connection
    pub fn force_end_for(&self, user_id: &str) -> Option<CallSession> {
        let mut table = self.table.lock();
        let call_id = *table.by_user.get(user_id)?;
        table.finish(call_id, CallEndReason::Disconnected)
    }

    /// Ring window elapsed. Only a session still ringing is ended.
    pub fn expire(&self, call_id: CallId) -> Option<CallSession> {
        let mut table = self.table.lock();
        match table.sessions.get_mut(&call_id) {
            Some(slot) if slot.session.state == CallState::Ringing => {
                // This task is the timer; do not abort ourselves
                slot.ring_timer = None;
                table.finish(call_id, CallEndReason::Timeout)
            },
            _ => None,
        }
    }

    pub fn active_call_of(&self, user_id: &str) -> Option<CallSession> {
        self.table
            .lock()
            .live_call_of(user_id)
            .map(|slot| slot.session.clone())
    }

    pub fn get(&self, call_id: CallId) -> Option<CallSession> {
        self.table
            .lock()
            .sessions
            .get(&call_id)
            .map(|slot| slot.session.clone())
    }

    pub fn active_count(&self) -> usize {
        self.table.lock().sessions.len()
    }
}

/// A caller hanging up before the callee answered is a cancellation
fn hang_up_reason(session: &CallSession, party_id: &str) -> CallEndReason {
    if session.state == CallState::Ringing && session.caller.id == party_id {
        CallEndReason::Cancelled
    } else {
        CallEndReason::HungUp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::time::Duration;
    use uuid::Uuid;

    fn user(id: &str) -> UserSummary {
        UserSummary::new(id, id.to_uppercase())
    }

    fn start(calls: &CallManager, from: &str, to: &str) -> Result<CallSession, AppError> {
        calls.initiate(&user(from), Uuid::new_v4(), &user(to), CallKind::Audio, || true, || true)
    }

    #[test]
    fn test_initiate_creates_ringing_session() {
        let calls = CallManager::new();
        let session = start(&calls, "ana", "ben").unwrap();

        assert_eq!(session.state_for("ana"), CallState::Calling);
        assert_eq!(session.state_for("ben"), CallState::Ringing);
        assert_eq!(calls.active_call_of("ben").unwrap().call_id, session.call_id);
        assert_eq!(calls.active_count(), 1);
    }

    #[test]
    fn test_initiate_guards() {
        let calls = CallManager::new();
        start(&calls, "ben", "cleo").unwrap();

        // Callee already in a call
        assert!(matches!(start(&calls, "ana", "ben"), Err(AppError::TargetBusy)));
        // Caller already in a call
        assert!(matches!(start(&calls, "ben", "dan"), Err(AppError::CallConflict)));
        // Calling yourself
        assert!(matches!(start(&calls, "ana", "ana"), Err(AppError::InvalidArgument(_))));
        // Callee offline
        let offline = calls.initiate(&user("ana"), Uuid::new_v4(), &user("dan"), CallKind::Video, || true, || false);
        assert!(matches!(offline, Err(AppError::TargetUnreachable)));

        // No stray sessions were created
        assert!(calls.active_call_of("ana").is_none());
        assert!(calls.active_call_of("dan").is_none());
        assert_eq!(calls.active_count(), 1);
    }

    #[test]
    fn test_unregistered_caller_is_refused() {
        let calls = CallManager::new();
        let result = calls.initiate(&user("ana"), Uuid::new_v4(), &user("ben"), CallKind::Audio, || false, || true);
        assert!(matches!(result, Err(AppError::Unauthorized(_))));
        assert!(calls.active_call_of("ana").is_none());
        assert!(calls.active_call_of("ben").is_none());
        assert_eq!(calls.active_count(), 0);
    }

    #[test]
    fn test_conflict_is_checked_before_reachability() {
        let calls = CallManager::new();
        start(&calls, "ana", "ben").unwrap();
        let result = calls.initiate(&user("ana"), Uuid::new_v4(), &user("dan"), CallKind::Audio, || true, || false);
        assert!(matches!(result, Err(AppError::CallConflict)));
    }

    #[test]
    fn test_accept_flow() {
        let calls = CallManager::new();
        let session = start(&calls, "ana", "ben").unwrap();
        let callee_conn = Uuid::new_v4();

        // Only the callee may accept
        assert!(matches!(
            calls.accept("ana", session.call_id, callee_conn),
            Err(AppError::CallNotFound)
        ));
        assert!(matches!(
            calls.accept("ben", Uuid::new_v4(), callee_conn),
            Err(AppError::CallNotFound)
        ));

        let accepted = calls.accept("ben", session.call_id, callee_conn).unwrap();
        assert_eq!(accepted.state(), CallState::Connecting);
        assert_eq!(accepted.callee_connection, Some(callee_conn));

        // Second accept is an invalid transition
        assert!(matches!(
            calls.accept("ben", session.call_id, callee_conn),
            Err(AppError::InvalidTransition { action: "accept", state: "connecting" })
        ));

        assert!(calls.mark_connected(session.call_id));
        assert!(!calls.mark_connected(session.call_id));
        assert_eq!(calls.get(session.call_id).unwrap().state(), CallState::Connected);
    }

    #[test]
    fn test_reject_and_cancel() {
        let calls = CallManager::new();
        let first = start(&calls, "ana", "ben").unwrap();

        assert!(matches!(calls.reject("ana", first.call_id), Err(AppError::CallNotFound)));
        let ended = calls.reject("ben", first.call_id).unwrap();
        assert_eq!(ended.state(), CallState::Ended);
        assert_eq!(ended.end_reason, Some(CallEndReason::Rejected));
        assert!(calls.active_call_of("ana").is_none());

        let second = start(&calls, "ana", "ben").unwrap();
        assert!(matches!(calls.cancel("ben", second.call_id), Err(AppError::CallNotFound)));
        calls.cancel("ana", second.call_id).unwrap();
        assert_eq!(calls.active_count(), 0);
    }

    #[test]
    fn test_reject_after_accept_is_invalid() {
        let calls = CallManager::new();
        let session = start(&calls, "ana", "ben").unwrap();
        calls.accept("ben", session.call_id, Uuid::new_v4()).unwrap();

        assert!(matches!(
            calls.reject("ben", session.call_id),
            Err(AppError::InvalidTransition { action: "reject", .. })
        ));
        assert!(calls.get(session.call_id).is_some());
    }

    #[test]
    fn test_end_by_id_and_by_pair() {
        let calls = CallManager::new();
        let session = start(&calls, "ana", "ben").unwrap();
        calls.accept("ben", session.call_id, Uuid::new_v4()).unwrap();

        assert!(matches!(calls.end_call("cleo", session.call_id), Err(AppError::CallNotFound)));
        calls.end_call("ben", session.call_id).unwrap();
        assert!(matches!(calls.end_call("ben", session.call_id), Err(AppError::CallNotFound)));

        start(&calls, "ana", "ben").unwrap();
        assert!(matches!(calls.end_between("ana", "cleo"), Err(AppError::CallNotFound)));
        let ended = calls.end_between("ben", "ana").unwrap();
        assert!(ended.is_between("ana", "ben"));
        assert_eq!(ended.end_reason, Some(CallEndReason::HungUp));

        // The caller hanging up before an answer is a cancellation
        start(&calls, "ana", "ben").unwrap();
        let ended = calls.end_between("ana", "ben").unwrap();
        assert_eq!(ended.end_reason, Some(CallEndReason::Cancelled));
        assert_eq!(calls.active_count(), 0);
    }

    #[test]
    fn test_signal_authorization() {
        let calls = CallManager::new();
        assert!(matches!(calls.authorize_signal("ana", "ben"), Err(AppError::CallNotFound)));

        let session = start(&calls, "ana", "ben").unwrap();
        assert_eq!(calls.authorize_signal("ana", "ben").unwrap().call_id, session.call_id);
        assert_eq!(calls.authorize_signal("ben", "ana").unwrap().call_id, session.call_id);
        assert!(matches!(calls.authorize_signal("ana", "cleo"), Err(AppError::CallNotFound)));
    }

    #[test]
    fn test_force_end_and_expire() {
        let calls = CallManager::new();
        let session = start(&calls, "ana", "ben").unwrap();

        let ended = calls.force_end_for("ben").unwrap();
        assert_eq!(ended.call_id, session.call_id);
        assert_eq!(ended.end_reason, Some(CallEndReason::Disconnected));
        assert!(calls.force_end_for("ben").is_none());
        assert!(calls.force_end_for("ana").is_none());

        // Expiry only ends sessions that are still ringing
        let ringing = start(&calls, "ana", "ben").unwrap();
        let expired = calls.expire(ringing.call_id).unwrap();
        assert_eq!(expired.end_reason, Some(CallEndReason::Timeout));
        let answered = start(&calls, "ana", "ben").unwrap();
        calls.accept("ben", answered.call_id, Uuid::new_v4()).unwrap();
        assert!(calls.expire(answered.call_id).is_none());
        assert!(calls.get(answered.call_id).is_some());
    }

    #[test]
    fn test_crossed_calls_create_exactly_one_session() {
        for _ in 0..50 {
            let calls = Arc::new(CallManager::new());
            let barrier = Arc::new(Barrier::new(2));

            let spawn = |from: &'static str, to: &'static str| {
                let calls = calls.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    start(&calls, from, to)
                })
            };
            let a = spawn("ana", "ben");
            let b = spawn("ben", "ana");
            let results = [a.join().unwrap(), b.join().unwrap()];

            let winners = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(winners, 1);
            let loser = results.iter().find(|r| r.is_err()).unwrap();
            assert!(matches!(loser, Err(AppError::CallConflict | AppError::TargetBusy)));
            assert_eq!(calls.active_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_terminal_transition_cancels_ring_timer() {
        let calls = CallManager::new();
        let session = start(&calls, "ana", "ben").unwrap();

        let timer = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        calls.attach_ring_timer(session.call_id, timer.abort_handle());
        calls.accept("ben", session.call_id, Uuid::new_v4()).unwrap();

        let outcome = timer.await;
        assert!(outcome.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_timer_for_finished_call_is_cancelled_immediately() {
        let calls = CallManager::new();
        let session = start(&calls, "ana", "ben").unwrap();
        calls.cancel("ana", session.call_id).unwrap();

        let timer = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        calls.attach_ring_timer(session.call_id, timer.abort_handle());
        assert!(timer.await.unwrap_err().is_cancelled());
    }
}
