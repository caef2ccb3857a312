//! Row -> domain-type conversions, kept apart from `mod.rs` so the query
//! bodies there aren't buried under `try_get` boilerplate.

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};
use uuid::Uuid;

use super::StorageError;
use crate::types::{
    Attempt, FinalVerdict, JudgeVerdict, LevelProgress, LogEvent, LogEventType, PendingTask,
    RewardClaim, RewardItem, RewardKind, Session, SessionState, User,
};

fn parse_dt(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Database(sqlx::Error::ColumnDecode {
            index: "<timestamp>".to_owned(),
            source: Box::new(e),
        }))
}

pub(super) fn user_from_row(row: &SqliteRow) -> Result<User, StorageError> {
    let created_at: String = row.try_get("created_at").map_err(StorageError::from_sqlx)?;
    Ok(User {
        user_id: row.try_get("user_id").map_err(StorageError::from_sqlx)?,
        display_name: row.try_get("display_name").map_err(StorageError::from_sqlx)?,
        banned: false,
        ban_reason: None,
        created_at: parse_dt(&created_at)?,
    })
}

pub(super) fn session_from_row(row: &SqliteRow) -> Result<Session, StorageError> {
    let state: String = row.try_get("state").map_err(StorageError::from_sqlx)?;
    let cooldown_until: Option<String> = row.try_get("cooldown_until").map_err(StorageError::from_sqlx)?;
    let inflight_task_id: Option<String> = row.try_get("inflight_task_id").map_err(StorageError::from_sqlx)?;
    let updated_at: String = row.try_get("updated_at").map_err(StorageError::from_sqlx)?;

    Ok(Session {
        user_id: row.try_get("user_id").map_err(StorageError::from_sqlx)?,
        level_id: row.try_get("level_id").map_err(StorageError::from_sqlx)?,
        state: SessionState::parse(&state)?,
        turn_index: row.try_get("turn_index").map_err(StorageError::from_sqlx)?,
        cooldown_until: cooldown_until.map(|s| parse_dt(&s)).transpose()?,
        inflight_task_id: inflight_task_id
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| StorageError::Database(sqlx::Error::ColumnDecode {
                index: "inflight_task_id".to_owned(),
                source: Box::new(e),
            }))?,
        updated_at: parse_dt(&updated_at)?,
    })
}

pub(super) fn level_progress_from_row(row: &SqliteRow) -> Result<LevelProgress, StorageError> {
    let passed_at: String = row.try_get("passed_at").map_err(StorageError::from_sqlx)?;
    Ok(LevelProgress {
        user_id: row.try_get("user_id").map_err(StorageError::from_sqlx)?,
        level_id: row.try_get("level_id").map_err(StorageError::from_sqlx)?,
        passed_at: parse_dt(&passed_at)?,
        turns_used: row.try_get("turns_used").map_err(StorageError::from_sqlx)?,
    })
}

pub(super) fn pending_task_from_row(row: &SqliteRow) -> Result<PendingTask, StorageError> {
    let task_id: String = row.try_get("task_id").map_err(StorageError::from_sqlx)?;
    let trace_id: String = row.try_get("trace_id").map_err(StorageError::from_sqlx)?;
    let enqueued_at: String = row.try_get("enqueued_at").map_err(StorageError::from_sqlx)?;

    Ok(PendingTask {
        task_id: parse_uuid(&task_id, "task_id")?,
        trace_id: parse_uuid(&trace_id, "trace_id")?,
        user_id: row.try_get("user_id").map_err(StorageError::from_sqlx)?,
        level_id: row.try_get("level_id").map_err(StorageError::from_sqlx)?,
        user_prompt: row.try_get("user_prompt").map_err(StorageError::from_sqlx)?,
        enqueued_at: parse_dt(&enqueued_at)?,
    })
}

pub(super) fn reward_item_from_row(row: &SqliteRow) -> Result<RewardItem, StorageError> {
    let kind: String = row.try_get("kind").map_err(StorageError::from_sqlx)?;
    let enabled: i64 = row.try_get("enabled").map_err(StorageError::from_sqlx)?;
    Ok(RewardItem {
        item_id: row.try_get("item_id").map_err(StorageError::from_sqlx)?,
        pool_id: row.try_get("pool_id").map_err(StorageError::from_sqlx)?,
        kind: RewardKind::parse(&kind)?,
        code: row.try_get("code").map_err(StorageError::from_sqlx)?,
        max_claims: row.try_get("max_claims").map_err(StorageError::from_sqlx)?,
        claimed_count: row.try_get("claimed_count").map_err(StorageError::from_sqlx)?,
        enabled: enabled != 0,
    })
}

pub(super) fn reward_claim_from_row(row: &SqliteRow) -> Result<RewardClaim, StorageError> {
    let claim_id: String = row.try_get("claim_id").map_err(StorageError::from_sqlx)?;
    let claimed_at: String = row.try_get("claimed_at").map_err(StorageError::from_sqlx)?;
    Ok(RewardClaim {
        claim_id: parse_uuid(&claim_id, "claim_id")?,
        user_id: row.try_get("user_id").map_err(StorageError::from_sqlx)?,
        level_id: row.try_get("level_id").map_err(StorageError::from_sqlx)?,
        pool_id: row.try_get("pool_id").map_err(StorageError::from_sqlx)?,
        item_id: row.try_get("item_id").map_err(StorageError::from_sqlx)?,
        code_snapshot: row.try_get("code_snapshot").map_err(StorageError::from_sqlx)?,
        claimed_at: parse_dt(&claimed_at)?,
    })
}

pub(super) fn log_event_from_row(row: &SqliteRow) -> Result<LogEvent, StorageError> {
    let event_id: String = row.try_get("event_id").map_err(StorageError::from_sqlx)?;
    let trace_id: String = row.try_get("trace_id").map_err(StorageError::from_sqlx)?;
    let event_type: String = row.try_get("event_type").map_err(StorageError::from_sqlx)?;
    let created_at: String = row.try_get("created_at").map_err(StorageError::from_sqlx)?;

    Ok(LogEvent {
        event_id: parse_uuid(&event_id, "event_id")?,
        trace_id: parse_uuid(&trace_id, "trace_id")?,
        event_type: parse_log_event_type(&event_type)?,
        user_id: row.try_get("user_id").map_err(StorageError::from_sqlx)?,
        level_id: row.try_get("level_id").map_err(StorageError::from_sqlx)?,
        turn_index: row.try_get("turn_index").map_err(StorageError::from_sqlx)?,
        content: row.try_get("content").map_err(StorageError::from_sqlx)?,
        created_at: parse_dt(&created_at)?,
    })
}

pub(super) fn attempt_from_row(row: &SqliteRow) -> Result<Attempt, StorageError> {
    let attempt_id: String = row.try_get("attempt_id").map_err(StorageError::from_sqlx)?;
    let trace_id: String = row.try_get("trace_id").map_err(StorageError::from_sqlx)?;
    let keyword_pass: i64 = row.try_get("keyword_pass").map_err(StorageError::from_sqlx)?;
    let judge_verdict: String = row.try_get("judge_verdict").map_err(StorageError::from_sqlx)?;
    let final_verdict: String = row.try_get("final_verdict").map_err(StorageError::from_sqlx)?;
    let created_at: String = row.try_get("created_at").map_err(StorageError::from_sqlx)?;

    Ok(Attempt {
        attempt_id: parse_uuid(&attempt_id, "attempt_id")?,
        trace_id: parse_uuid(&trace_id, "trace_id")?,
        user_id: row.try_get("user_id").map_err(StorageError::from_sqlx)?,
        level_id: row.try_get("level_id").map_err(StorageError::from_sqlx)?,
        turn_index: row.try_get("turn_index").map_err(StorageError::from_sqlx)?,
        user_prompt: row.try_get("user_prompt").map_err(StorageError::from_sqlx)?,
        llm_output: row.try_get("llm_output").map_err(StorageError::from_sqlx)?,
        keyword_pass: keyword_pass != 0,
        judge_verdict: JudgeVerdict::parse(&judge_verdict)?,
        judge_reason: row.try_get("judge_reason").map_err(StorageError::from_sqlx)?,
        final_verdict: FinalVerdict::parse(&final_verdict)?,
        created_at: parse_dt(&created_at)?,
    })
}

fn parse_log_event_type(s: &str) -> Result<LogEventType, StorageError> {
    match s {
        "USER_IN" => Ok(LogEventType::UserIn),
        "SYSTEM_OUT" => Ok(LogEventType::SystemOut),
        "LLM_CALL" => Ok(LogEventType::LlmCall),
        "GRADE" => Ok(LogEventType::Grade),
        "REWARD_CLAIM" => Ok(LogEventType::RewardClaim),
        "ERROR" => Ok(LogEventType::Error),
        other => Err(StorageError::Corrupt(crate::types::TypeParseError::InvalidEnum {
            field: "log_events.event_type",
            value: other.to_owned(),
        })),
    }
}

fn parse_uuid(s: &str, field: &'static str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(s).map_err(|e| {
        StorageError::Database(sqlx::Error::ColumnDecode {
            index: field.to_owned(),
            source: Box::new(e),
        })
    })
}
