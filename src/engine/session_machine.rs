//! Pure session state transitions (spec §4.G state diagram), kept free of
//! I/O so the machine itself is exhaustively unit-testable.

use chrono::{DateTime, Utc};

use crate::content::Level;
use crate::types::{Session, SessionState};

/// Move a session back to READY after a transient system error. The turn
/// count is untouched — transient errors are never counted as an attempt.
pub fn transition_transient(session: &mut Session, now: DateTime<Utc>) {
    session.state = SessionState::Ready;
    session.inflight_task_id = None;
    session.cooldown_until = None;
    session.updated_at = now;
}

/// Move a session to PASSED.
pub fn transition_pass(session: &mut Session, now: DateTime<Utc>) {
    session.state = SessionState::Passed;
    session.inflight_task_id = None;
    session.updated_at = now;
}

/// Move a session after a graded FAIL: increments `turn_index` and either
/// transitions to FAILED_OUT (turns exhausted) or COOLDOWN.
pub fn transition_fail(session: &mut Session, level: &Level, now: DateTime<Utc>) {
    session.turn_index = session.turn_index.saturating_add(1);
    session.inflight_task_id = None;
    if session.turn_index >= level.max_turns {
        session.state = SessionState::FailedOut;
        session.cooldown_until = None;
    } else {
        session.state = SessionState::Cooldown;
        session.cooldown_until = Some(now + chrono::Duration::seconds(level.cooldown_seconds_after_fail));
    }
    session.updated_at = now;
}
