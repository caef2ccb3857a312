//! Shared domain types persisted and passed between modules.
//!
//! Enums that are stored in SQLite use a `TEXT` representation via
//! `as_str`/`parse`, mirroring the string-enum convention used throughout
//! this crate's storage layer rather than relying on integer discriminants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A participant, scoped to a channel (e.g. one Telegram user).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Channel-scoped identifier (e.g. Telegram numeric id as a string).
    pub user_id: String,
    /// Display name shown in logs and templated replies.
    pub display_name: String,
    /// Whether the user is banned from the activity.
    pub banned: bool,
    /// Reason recorded at ban time, if any.
    pub ban_reason: Option<String>,
    /// When the user record was first created.
    pub created_at: DateTime<Utc>,
}

/// The state of a per-(user, level) session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Ready to accept a submission.
    Ready,
    /// An attempt is queued or being processed.
    Inflight,
    /// A fail was recorded; the user must wait out a cooldown.
    Cooldown,
    /// The level has been passed.
    Passed,
    /// The user exhausted all turns without passing.
    FailedOut,
}

impl SessionState {
    /// The string stored in the `sessions.state` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Inflight => "INFLIGHT",
            Self::Cooldown => "COOLDOWN",
            Self::Passed => "PASSED",
            Self::FailedOut => "FAILED_OUT",
        }
    }

    /// Parse a `sessions.state` column value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised state.
    pub fn parse(s: &str) -> Result<Self, TypeParseError> {
        match s {
            "READY" => Ok(Self::Ready),
            "INFLIGHT" => Ok(Self::Inflight),
            "COOLDOWN" => Ok(Self::Cooldown),
            "PASSED" => Ok(Self::Passed),
            "FAILED_OUT" => Ok(Self::FailedOut),
            other => Err(TypeParseError::InvalidEnum {
                field: "sessions.state",
                value: other.to_owned(),
            }),
        }
    }
}

/// Per (user, level) progress record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Owning user.
    pub user_id: String,
    /// Level this session tracks progress for.
    pub level_id: i64,
    /// Current state machine position.
    pub state: SessionState,
    /// Number of failed turns consumed so far (0..max_turns).
    pub turn_index: i64,
    /// When a COOLDOWN state expires; meaningless in other states.
    pub cooldown_until: Option<DateTime<Utc>>,
    /// The task currently processing this session, if INFLIGHT.
    pub inflight_task_id: Option<Uuid>,
    /// Last time this row was written.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// A brand-new session for a level the user has just unlocked.
    pub fn new_ready(user_id: impl Into<String>, level_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            level_id,
            state: SessionState::Ready,
            turn_index: 0,
            cooldown_until: None,
            inflight_task_id: None,
            updated_at: now,
        }
    }
}

/// Record of a user having passed a level. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelProgress {
    /// The user who passed.
    pub user_id: String,
    /// The level passed.
    pub level_id: i64,
    /// When the level was passed.
    pub passed_at: DateTime<Utc>,
    /// Number of turns consumed to pass.
    pub turns_used: i64,
}

/// Outcome of the LLM judge stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JudgeVerdict {
    /// The judge explicitly passed the attempt.
    Pass,
    /// The judge explicitly failed the attempt.
    Fail,
    /// The judge's output could not be parsed — a transient system error,
    /// not a user-attributable failure.
    Error,
}

impl JudgeVerdict {
    /// The string stored in `attempts.judge_verdict`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
        }
    }

    /// Parse an `attempts.judge_verdict` column value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised verdict.
    pub fn parse(s: &str) -> Result<Self, TypeParseError> {
        match s {
            "PASS" => Ok(Self::Pass),
            "FAIL" => Ok(Self::Fail),
            "ERROR" => Ok(Self::Error),
            other => Err(TypeParseError::InvalidEnum {
                field: "attempts.judge_verdict",
                value: other.to_owned(),
            }),
        }
    }
}

/// The final, combined verdict of a graded attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalVerdict {
    /// Keyword match and judge both passed.
    Pass,
    /// Either stage failed (or errored).
    Fail,
}

impl FinalVerdict {
    /// The string stored in `attempts.final_verdict`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        }
    }

    /// Parse an `attempts.final_verdict` column value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised verdict.
    pub fn parse(s: &str) -> Result<Self, TypeParseError> {
        match s {
            "PASS" => Ok(Self::Pass),
            "FAIL" => Ok(Self::Fail),
            other => Err(TypeParseError::InvalidEnum {
                field: "attempts.final_verdict",
                value: other.to_owned(),
            }),
        }
    }
}

/// An immutable record of one submit -> judge cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    /// Unique attempt identifier.
    pub attempt_id: Uuid,
    /// Trace id linking this attempt's log events.
    pub trace_id: Uuid,
    /// The user who submitted.
    pub user_id: String,
    /// The level attempted.
    pub level_id: i64,
    /// Turn index at the time of submission.
    pub turn_index: i64,
    /// The user's raw prompt text.
    pub user_prompt: String,
    /// The LLM's raw output text.
    pub llm_output: String,
    /// Whether the keyword stage matched.
    pub keyword_pass: bool,
    /// The judge stage's verdict.
    pub judge_verdict: JudgeVerdict,
    /// The judge's reason string, if any.
    pub judge_reason: Option<String>,
    /// The combined verdict.
    pub final_verdict: FinalVerdict,
    /// When the attempt was recorded.
    pub created_at: DateTime<Utc>,
}

/// The kind of reward a `RewardItem` dispenses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewardKind {
    /// An Alipay redemption code; a pool may have many with `max_claims > 1`.
    AlipayCode,
    /// A JD e-card code; always single-use (`max_claims == 1`).
    JdEcard,
}

impl RewardKind {
    /// The string stored in `reward_items.kind`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlipayCode => "ALIPAY_CODE",
            Self::JdEcard => "JD_ECARD",
        }
    }

    /// Parse a `reward_items.kind` column value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised kind.
    pub fn parse(s: &str) -> Result<Self, TypeParseError> {
        match s {
            "ALIPAY_CODE" => Ok(Self::AlipayCode),
            "JD_ECARD" => Ok(Self::JdEcard),
            other => Err(TypeParseError::InvalidEnum {
                field: "reward_items.kind",
                value: other.to_owned(),
            }),
        }
    }
}

/// A single dispensable reward tuple from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardItem {
    /// Unique item identifier (stable across config reloads).
    pub item_id: String,
    /// The pool this item belongs to.
    pub pool_id: String,
    /// The kind of reward.
    pub kind: RewardKind,
    /// The opaque reward code/payload.
    pub code: String,
    /// Maximum number of claims this item may serve (`None` = unlimited,
    /// only valid for `ALIPAY_CODE`).
    pub max_claims: Option<i64>,
    /// Number of claims served so far; monotonic non-decreasing.
    pub claimed_count: i64,
    /// Whether this item is selectable. Items absent from a reloaded
    /// config are disabled, never deleted.
    pub enabled: bool,
}

impl RewardItem {
    /// Whether this item currently has claimable inventory.
    pub fn has_capacity(&self) -> bool {
        self.enabled
            && match self.max_claims {
                Some(max) => self.claimed_count < max,
                None => true,
            }
    }
}

/// The award a user received for passing a level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardClaim {
    /// Unique claim identifier.
    pub claim_id: Uuid,
    /// The user who claimed.
    pub user_id: String,
    /// The level that was passed to earn this claim.
    pub level_id: i64,
    /// The pool the item was drawn from.
    pub pool_id: String,
    /// The item claimed.
    pub item_id: String,
    /// A snapshot of the item's code at claim time (auditable even if the
    /// item is later disabled).
    pub code_snapshot: String,
    /// When the claim was recorded.
    pub claimed_at: DateTime<Utc>,
}

/// A durable queue row backing the persistent queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTask {
    /// Unique task identifier.
    pub task_id: Uuid,
    /// Trace id shared with the eventual `Attempt`/`LogEvent`s.
    pub trace_id: Uuid,
    /// The submitting user.
    pub user_id: String,
    /// The level being attempted.
    pub level_id: i64,
    /// The raw prompt text to grade.
    pub user_prompt: String,
    /// When the task was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

/// The category of an append-only audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEventType {
    /// A validated inbound user message.
    UserIn,
    /// An outbound reply sent to the user.
    SystemOut,
    /// An LLM generation call.
    LlmCall,
    /// A grading decision.
    Grade,
    /// A reward claim decision.
    RewardClaim,
    /// An error condition.
    Error,
}

impl LogEventType {
    /// The string stored in `log_events.event_type`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserIn => "USER_IN",
            Self::SystemOut => "SYSTEM_OUT",
            Self::LlmCall => "LLM_CALL",
            Self::Grade => "GRADE",
            Self::RewardClaim => "REWARD_CLAIM",
            Self::Error => "ERROR",
        }
    }
}

/// Maximum length, in characters, retained in `LogEvent::content`.
pub const LOG_CONTENT_TRUNCATE_CHARS: usize = 500;

/// An append-only audit row. Reward codes never appear in `content` —
/// callers must pass `item_id` references instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Trace id linking all events for one attempt.
    pub trace_id: Uuid,
    /// The category of event.
    pub event_type: LogEventType,
    /// The user this event concerns, if any.
    pub user_id: Option<String>,
    /// The level this event concerns, if any.
    pub level_id: Option<i64>,
    /// The turn index this event concerns, if any.
    pub turn_index: Option<i64>,
    /// Freeform content, truncated to `LOG_CONTENT_TRUNCATE_CHARS`.
    pub content: String,
    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

impl LogEvent {
    /// Build a log event, truncating `content` to the audit limit.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trace_id: Uuid,
        event_type: LogEventType,
        user_id: Option<String>,
        level_id: Option<i64>,
        turn_index: Option<i64>,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let content = truncate_chars(&content.into(), LOG_CONTENT_TRUNCATE_CHARS);
        Self {
            event_id: Uuid::new_v4(),
            trace_id,
            event_type,
            user_id,
            level_id,
            turn_index,
            content,
            created_at: now,
        }
    }
}

/// Truncate a string to at most `max_chars` Unicode scalar values.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_owned()
    } else {
        s.chars().take(max_chars).collect()
    }
}

/// Error parsing a stored string-enum column.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypeParseError {
    /// An enum column held a value we don't recognise.
    #[error("invalid {field} value: {value:?}")]
    InvalidEnum {
        /// Which column contained the bad value.
        field: &'static str,
        /// The unexpected value.
        value: String,
    },
}

/// Serializable reward claim outcome, shared with the config/admin surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardSnapshot {
    /// The claimed item's id.
    pub item_id: String,
    /// The claimed item's opaque code.
    pub code: String,
    /// The claimed item's kind.
    pub kind: String,
}
