//! Admin operations (spec §6): global toggle via config reload, stats,
//! ban/unban, session reset, queue clear, log export. These are "for
//! completeness" per spec §6 — the full admin transport is out of scope,
//! but the operations themselves are cheap wrappers over `Storage` and are
//! exposed directly as CLI subcommands (`main.rs`).

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::content::{Content, ContentError, LoadedContent};
use crate::queue::PersistentQueue;
use crate::storage::{Stats, Storage, StorageError};
use crate::types::{LogEvent, SessionState};

/// Errors from admin operations.
#[derive(Debug, Error)]
pub enum AdminError {
    /// Reloading content failed.
    #[error("content reload failed: {0}")]
    Content(#[from] ContentError),
    /// A storage call failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Reload the activity/levels/rewards documents and upsert reward items
/// into storage, preserving `claimed_count` (spec §6, §9).
///
/// # Errors
///
/// Returns [`AdminError`] if the content fails to load/validate or a
/// storage write fails.
pub async fn reload_config(
    content_loader: &dyn Content,
    content: &Arc<RwLock<LoadedContent>>,
    storage: &dyn Storage,
) -> Result<(), AdminError> {
    let loaded = content_loader.load().await?;
    for pool in &loaded.pools {
        storage.reload_reward_items(&pool.pool_id, pool.enabled, &pool.items).await?;
    }
    *content.write().await = loaded;
    Ok(())
}

/// Queue depth and today's claim count.
///
/// # Errors
///
/// Returns [`AdminError`] if storage cannot be read.
pub async fn stats(storage: &dyn Storage) -> Result<Stats, AdminError> {
    Ok(storage.stats().await?)
}

/// Ban a user.
///
/// # Errors
///
/// Returns [`AdminError`] if the write fails.
pub async fn ban_user(storage: &dyn Storage, user_id: &str, reason: &str) -> Result<(), AdminError> {
    storage.ban_user(user_id, reason, Utc::now()).await?;
    Ok(())
}

/// Unban a user.
///
/// # Errors
///
/// Returns [`AdminError`] if the write fails.
pub async fn unban_user(storage: &dyn Storage, user_id: &str) -> Result<(), AdminError> {
    storage.unban_user(user_id).await?;
    Ok(())
}

/// Reset a user's session for a level back to READY. Does not revoke any
/// prior reward claim (spec §6).
///
/// # Errors
///
/// Returns [`AdminError`] if the write fails.
pub async fn reset_session(storage: &dyn Storage, user_id: &str, level_id: i64) -> Result<(), AdminError> {
    storage.reset_session(user_id, level_id, Utc::now()).await?;
    Ok(())
}

/// Drop every pending task, releasing each task's session back to READY
/// (spec §5 "Cancellation").
///
/// # Errors
///
/// Returns [`AdminError`] if a storage call fails.
pub async fn clear_queue(storage: &dyn Storage, queue: &PersistentQueue) -> Result<usize, AdminError> {
    let dropped = storage.clear_queue().await?;
    queue.clear().await;

    let now = Utc::now();
    for task in &dropped {
        if let Some(mut session) = storage.get_session(&task.user_id, task.level_id).await? {
            if session.state == SessionState::Inflight {
                session.state = SessionState::Ready;
                session.inflight_task_id = None;
                session.updated_at = now;
                storage.upsert_session(&session).await?;
            }
        }
    }
    Ok(dropped.len())
}

/// Export every log event recorded on `date` (UTC).
///
/// # Errors
///
/// Returns [`AdminError`] if storage cannot be read.
pub async fn export_log(storage: &dyn Storage, date: NaiveDate) -> Result<Vec<LogEvent>, AdminError> {
    Ok(storage.export_log_events(date).await?)
}
