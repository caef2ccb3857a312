//! Transactional persistence for users, sessions, attempts, level-pass
//! records, reward items, claims, pending tasks, and log events.
//!
//! [`SqliteStorage`] is the crate's one concrete [`Storage`] implementation,
//! following the teacher's `SessionManager`/`MemoryEngine` convention of "a
//! struct wrapping a `SqlitePool` with one method per storage contract verb."
//! Every mutating method runs inside a single `pool.begin()` transaction.

mod rows;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use crate::content::RewardItemConfig;
use crate::types::{
    Attempt, LevelProgress, LogEvent, PendingTask, RewardClaim, RewardItem, RewardKind, Session,
    SessionState, TypeParseError, User,
};

/// Inline schema, executed once at startup via `sqlx::raw_sql`, matching
/// the teacher's `kernel/journal.rs` inline-`CREATE TABLE` convention —
/// this is a single-tenant embedded engine, not a service with
/// independently versioned schema rollout.
const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS users (
    user_id      TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS bans (
    user_id   TEXT PRIMARY KEY,
    reason    TEXT,
    banned_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    user_id          TEXT NOT NULL,
    level_id         INTEGER NOT NULL,
    state            TEXT NOT NULL,
    turn_index       INTEGER NOT NULL,
    cooldown_until   TEXT,
    inflight_task_id TEXT,
    updated_at       TEXT NOT NULL,
    PRIMARY KEY (user_id, level_id)
);

CREATE TABLE IF NOT EXISTS level_progress (
    user_id    TEXT NOT NULL,
    level_id   INTEGER NOT NULL,
    passed_at  TEXT NOT NULL,
    turns_used INTEGER NOT NULL,
    PRIMARY KEY (user_id, level_id)
);

CREATE TABLE IF NOT EXISTS attempts (
    attempt_id    TEXT PRIMARY KEY,
    trace_id      TEXT NOT NULL,
    user_id       TEXT NOT NULL,
    level_id      INTEGER NOT NULL,
    turn_index    INTEGER NOT NULL,
    user_prompt   TEXT NOT NULL,
    llm_output    TEXT NOT NULL,
    keyword_pass  INTEGER NOT NULL,
    judge_verdict TEXT NOT NULL,
    judge_reason  TEXT,
    final_verdict TEXT NOT NULL,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attempts_user_level ON attempts(user_id, level_id);

CREATE TABLE IF NOT EXISTS reward_items (
    item_id       TEXT PRIMARY KEY,
    pool_id       TEXT NOT NULL,
    kind          TEXT NOT NULL,
    code          TEXT NOT NULL,
    max_claims    INTEGER,
    claimed_count INTEGER NOT NULL DEFAULT 0,
    enabled       INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_reward_items_pool ON reward_items(pool_id);

CREATE TABLE IF NOT EXISTS reward_claims (
    claim_id      TEXT PRIMARY KEY,
    user_id       TEXT NOT NULL,
    level_id      INTEGER NOT NULL,
    pool_id       TEXT NOT NULL,
    item_id       TEXT NOT NULL,
    code_snapshot TEXT NOT NULL,
    claimed_at    TEXT NOT NULL,
    UNIQUE (user_id, level_id)
);
CREATE INDEX IF NOT EXISTS idx_reward_claims_pool ON reward_claims(pool_id);

CREATE TABLE IF NOT EXISTS pending_tasks (
    task_id      TEXT PRIMARY KEY,
    trace_id     TEXT NOT NULL,
    user_id      TEXT NOT NULL,
    level_id     INTEGER NOT NULL,
    user_prompt  TEXT NOT NULL,
    enqueued_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pending_tasks_order ON pending_tasks(enqueued_at, task_id);

CREATE TABLE IF NOT EXISTS log_events (
    event_id   TEXT PRIMARY KEY,
    trace_id   TEXT NOT NULL,
    event_type TEXT NOT NULL,
    user_id    TEXT,
    level_id   INTEGER,
    turn_index INTEGER,
    content    TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_log_events_trace ON log_events(trace_id);
CREATE INDEX IF NOT EXISTS idx_log_events_created ON log_events(created_at);
"#;

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// SQLite reported `SQLITE_BUSY` / a lock contention timeout — retryable.
    #[error("storage busy")]
    Busy,
    /// Any other database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A stored string-enum column held an unrecognised value.
    #[error("corrupt row: {0}")]
    Corrupt(#[from] TypeParseError),
}

impl StorageError {
    fn from_sqlx(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.code().as_deref() == Some("5") || db_err.message().contains("database is locked") {
                return Self::Busy;
            }
        }
        Self::Database(err)
    }
}

/// The outcome of `ClaimReward` (spec §4.D).
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// A fresh claim was recorded.
    Claimed {
        /// The recorded claim.
        claim: RewardClaim,
        /// The item dispensed.
        item: RewardItem,
    },
    /// This (user, level) already had a claim; it is returned so the
    /// engine can remind the user of their existing reward.
    AlreadyClaimed(RewardClaim),
    /// No enabled item in the pool had remaining capacity. The caller is
    /// still expected to mark the level passed (spec §4.E step 5).
    PoolExhausted,
}

/// Queue-depth and claim-count snapshot for the admin `stats` operation.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    /// Number of rows currently in `pending_tasks`.
    pub queue_depth: i64,
    /// Number of reward claims recorded today (UTC).
    pub claims_today: i64,
}

/// Transactional persistence contract (spec §4.A).
#[async_trait]
pub trait Storage: Send + Sync {
    /// Idempotently fetch or create a user.
    async fn get_or_create_user(&self, user_id: &str, display_name: &str) -> Result<User, StorageError>;

    /// Fetch a session by its primary key.
    async fn get_session(&self, user_id: &str, level_id: i64) -> Result<Option<Session>, StorageError>;

    /// Replace a session row by primary key.
    async fn upsert_session(&self, session: &Session) -> Result<(), StorageError>;

    /// Atomically flip a session to INFLIGHT, persist its backing task,
    /// and append the USER_IN audit row — the anti-double-submit barrier
    /// of spec §4.G step 6, all inside one transaction.
    async fn admit_task(
        &self,
        session: &Session,
        task: &PendingTask,
        log_event: &LogEvent,
    ) -> Result<(), StorageError>;

    /// Whether `(user_id, level_id)` has a `LevelProgress` row.
    async fn is_level_passed(&self, user_id: &str, level_id: i64) -> Result<bool, StorageError>;

    /// Idempotently record that a level was passed.
    async fn mark_level_passed(
        &self,
        user_id: &str,
        level_id: i64,
        turns_used: i64,
        now: DateTime<Utc>,
    ) -> Result<LevelProgress, StorageError>;

    /// Append an immutable attempt row.
    async fn record_attempt(&self, attempt: &Attempt) -> Result<(), StorageError>;

    /// Append an audit log row.
    async fn append_log_event(&self, event: &LogEvent) -> Result<(), StorageError>;

    /// Persist a new pending task row.
    async fn enqueue_task(&self, task: &PendingTask) -> Result<(), StorageError>;

    /// List pending tasks ordered by `enqueued_at` ascending, `task_id` tiebreak.
    async fn list_pending_tasks_ordered(&self) -> Result<Vec<PendingTask>, StorageError>;

    /// Delete a pending task row (idempotent: missing rows are not an error).
    async fn delete_task(&self, task_id: Uuid) -> Result<(), StorageError>;

    /// Delete every pending task row, returning the rows that were removed
    /// (admin `clear_queue`; the caller releases each task's session).
    async fn clear_queue(&self) -> Result<Vec<PendingTask>, StorageError>;

    /// Atomically claim a reward item from `pool_id` for `(user_id, level_id)`.
    ///
    /// Implements the full protocol of spec §4.D in one transaction:
    /// already-claimed check, ordered candidate selection, conditional
    /// update with bounded retry, claim insert, and level-progress insert.
    async fn claim_reward(
        &self,
        pool_id: &str,
        user_id: &str,
        level_id: i64,
        turns_used: i64,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StorageError>;

    /// Fetch an existing claim for `(user_id, level_id)`, if any.
    async fn get_claim(&self, user_id: &str, level_id: i64) -> Result<Option<RewardClaim>, StorageError>;

    /// Upsert a pool's configured items by `item_id`. Existing
    /// `claimed_count` is preserved; items no longer present in `items`
    /// are disabled, never deleted (spec §3, §9). When `pool_enabled` is
    /// `false`, every item in the pool is stored disabled regardless of
    /// config, so `claim_reward`'s `enabled = 1` filter also honors a
    /// pool-level disable.
    async fn reload_reward_items(&self, pool_id: &str, pool_enabled: bool, items: &[RewardItemConfig]) -> Result<(), StorageError>;

    /// List all reward items in a pool (enabled and disabled).
    async fn list_reward_items(&self, pool_id: &str) -> Result<Vec<RewardItem>, StorageError>;

    /// Record a ban.
    async fn ban_user(&self, user_id: &str, reason: &str, now: DateTime<Utc>) -> Result<(), StorageError>;

    /// Remove a ban.
    async fn unban_user(&self, user_id: &str) -> Result<(), StorageError>;

    /// Whether a user is currently banned.
    async fn is_banned(&self, user_id: &str) -> Result<bool, StorageError>;

    /// Reset a user's session for a level back to READY, clearing turn
    /// count and cooldown. Does not revoke any prior reward claim.
    async fn reset_session(&self, user_id: &str, level_id: i64, now: DateTime<Utc>) -> Result<(), StorageError>;

    /// Queue depth and today's claim count.
    async fn stats(&self) -> Result<Stats, StorageError>;

    /// Export all log events recorded on `date` (UTC).
    async fn export_log_events(&self, date: NaiveDate) -> Result<Vec<LogEvent>, StorageError>;
}

/// The sole `Storage` implementation, backed by SQLite via `sqlx`.
pub struct SqliteStorage {
    pool: SqlitePool,
}

/// Bound on how many distinct candidate items `claim_reward` will try
/// conditionally updating before giving up (spec §4.D step 4).
const MAX_CLAIM_CANDIDATES: usize = 8;

impl SqliteStorage {
    /// Open (creating if absent) the SQLite database at `path` and ensure
    /// the schema exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot
    /// be created.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(StorageError::from_sqlx)?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(StorageError::from_sqlx)?;

        Ok(Self { pool })
    }

    /// An in-memory database, used by tests.
    pub async fn connect_in_memory() -> Result<Self, StorageError> {
        Self::connect("sqlite::memory:").await
    }

    /// Access to the underlying pool, e.g. for `tests` fixtures that need
    /// to simulate a crash by opening a second `SqliteStorage` over the
    /// same on-disk file.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn get_or_create_user(&self, user_id: &str, display_name: &str) -> Result<User, StorageError> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from_sqlx)?;

        if let Some(row) = sqlx::query("SELECT user_id, display_name, created_at FROM users WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StorageError::from_sqlx)?
        {
            tx.commit().await.map_err(StorageError::from_sqlx)?;
            return rows::user_from_row(&row);
        }

        let now = Utc::now();
        sqlx::query("INSERT INTO users (user_id, display_name, created_at) VALUES (?1, ?2, ?3)")
            .bind(user_id)
            .bind(display_name)
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from_sqlx)?;
        tx.commit().await.map_err(StorageError::from_sqlx)?;

        Ok(User {
            user_id: user_id.to_owned(),
            display_name: display_name.to_owned(),
            banned: false,
            ban_reason: None,
            created_at: now,
        })
    }

    async fn get_session(&self, user_id: &str, level_id: i64) -> Result<Option<Session>, StorageError> {
        let row = sqlx::query(
            "SELECT user_id, level_id, state, turn_index, cooldown_until, inflight_task_id, updated_at \
             FROM sessions WHERE user_id = ?1 AND level_id = ?2",
        )
        .bind(user_id)
        .bind(level_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::from_sqlx)?;

        row.as_ref().map(rows::session_from_row).transpose()
    }

    async fn upsert_session(&self, session: &Session) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO sessions (user_id, level_id, state, turn_index, cooldown_until, inflight_task_id, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(user_id, level_id) DO UPDATE SET \
               state = excluded.state, \
               turn_index = excluded.turn_index, \
               cooldown_until = excluded.cooldown_until, \
               inflight_task_id = excluded.inflight_task_id, \
               updated_at = excluded.updated_at",
        )
        .bind(&session.user_id)
        .bind(session.level_id)
        .bind(session.state.as_str())
        .bind(session.turn_index)
        .bind(session.cooldown_until.map(|t| t.to_rfc3339()))
        .bind(session.inflight_task_id.map(|t| t.to_string()))
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(StorageError::from_sqlx)?;
        Ok(())
    }

    async fn admit_task(
        &self,
        session: &Session,
        task: &PendingTask,
        log_event: &LogEvent,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from_sqlx)?;

        sqlx::query(
            "INSERT INTO sessions (user_id, level_id, state, turn_index, cooldown_until, inflight_task_id, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(user_id, level_id) DO UPDATE SET \
               state = excluded.state, \
               turn_index = excluded.turn_index, \
               cooldown_until = excluded.cooldown_until, \
               inflight_task_id = excluded.inflight_task_id, \
               updated_at = excluded.updated_at",
        )
        .bind(&session.user_id)
        .bind(session.level_id)
        .bind(session.state.as_str())
        .bind(session.turn_index)
        .bind(session.cooldown_until.map(|t| t.to_rfc3339()))
        .bind(session.inflight_task_id.map(|t| t.to_string()))
        .bind(session.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from_sqlx)?;

        sqlx::query(
            "INSERT INTO pending_tasks (task_id, trace_id, user_id, level_id, user_prompt, enqueued_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(task.task_id.to_string())
        .bind(task.trace_id.to_string())
        .bind(&task.user_id)
        .bind(task.level_id)
        .bind(&task.user_prompt)
        .bind(task.enqueued_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from_sqlx)?;

        sqlx::query(
            "INSERT INTO log_events (event_id, trace_id, event_type, user_id, level_id, turn_index, content, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(log_event.event_id.to_string())
        .bind(log_event.trace_id.to_string())
        .bind(log_event.event_type.as_str())
        .bind(&log_event.user_id)
        .bind(log_event.level_id)
        .bind(log_event.turn_index)
        .bind(&log_event.content)
        .bind(log_event.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from_sqlx)?;

        tx.commit().await.map_err(StorageError::from_sqlx)?;
        Ok(())
    }

    async fn is_level_passed(&self, user_id: &str, level_id: i64) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 FROM level_progress WHERE user_id = ?1 AND level_id = ?2")
            .bind(user_id)
            .bind(level_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::from_sqlx)?;
        Ok(row.is_some())
    }

    async fn mark_level_passed(
        &self,
        user_id: &str,
        level_id: i64,
        turns_used: i64,
        now: DateTime<Utc>,
    ) -> Result<LevelProgress, StorageError> {
        sqlx::query(
            "INSERT INTO level_progress (user_id, level_id, passed_at, turns_used) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(user_id, level_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(level_id)
        .bind(now.to_rfc3339())
        .bind(turns_used)
        .execute(&self.pool)
        .await
        .map_err(StorageError::from_sqlx)?;

        let row = sqlx::query("SELECT user_id, level_id, passed_at, turns_used FROM level_progress WHERE user_id = ?1 AND level_id = ?2")
            .bind(user_id)
            .bind(level_id)
            .fetch_one(&self.pool)
            .await
            .map_err(StorageError::from_sqlx)?;
        rows::level_progress_from_row(&row)
    }

    async fn record_attempt(&self, attempt: &Attempt) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO attempts (attempt_id, trace_id, user_id, level_id, turn_index, user_prompt, \
               llm_output, keyword_pass, judge_verdict, judge_reason, final_verdict, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(attempt.attempt_id.to_string())
        .bind(attempt.trace_id.to_string())
        .bind(&attempt.user_id)
        .bind(attempt.level_id)
        .bind(attempt.turn_index)
        .bind(&attempt.user_prompt)
        .bind(&attempt.llm_output)
        .bind(attempt.keyword_pass)
        .bind(attempt.judge_verdict.as_str())
        .bind(&attempt.judge_reason)
        .bind(attempt.final_verdict.as_str())
        .bind(attempt.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(StorageError::from_sqlx)?;
        Ok(())
    }

    async fn append_log_event(&self, event: &LogEvent) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO log_events (event_id, trace_id, event_type, user_id, level_id, turn_index, content, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(event.event_id.to_string())
        .bind(event.trace_id.to_string())
        .bind(event.event_type.as_str())
        .bind(&event.user_id)
        .bind(event.level_id)
        .bind(event.turn_index)
        .bind(&event.content)
        .bind(event.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(StorageError::from_sqlx)?;
        Ok(())
    }

    async fn enqueue_task(&self, task: &PendingTask) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO pending_tasks (task_id, trace_id, user_id, level_id, user_prompt, enqueued_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(task.task_id.to_string())
        .bind(task.trace_id.to_string())
        .bind(&task.user_id)
        .bind(task.level_id)
        .bind(&task.user_prompt)
        .bind(task.enqueued_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(StorageError::from_sqlx)?;
        Ok(())
    }

    async fn list_pending_tasks_ordered(&self) -> Result<Vec<PendingTask>, StorageError> {
        let rows = sqlx::query(
            "SELECT task_id, trace_id, user_id, level_id, user_prompt, enqueued_at \
             FROM pending_tasks ORDER BY enqueued_at ASC, task_id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::from_sqlx)?;

        rows.iter().map(rows::pending_task_from_row).collect()
    }

    async fn delete_task(&self, task_id: Uuid) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM pending_tasks WHERE task_id = ?1")
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StorageError::from_sqlx)?;
        Ok(())
    }

    async fn clear_queue(&self) -> Result<Vec<PendingTask>, StorageError> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from_sqlx)?;
        let existing = sqlx::query(
            "SELECT task_id, trace_id, user_id, level_id, user_prompt, enqueued_at FROM pending_tasks",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(StorageError::from_sqlx)?;
        let tasks: Result<Vec<PendingTask>, StorageError> =
            existing.iter().map(rows::pending_task_from_row).collect();
        let tasks = tasks?;

        sqlx::query("DELETE FROM pending_tasks")
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from_sqlx)?;
        tx.commit().await.map_err(StorageError::from_sqlx)?;
        Ok(tasks)
    }

    async fn claim_reward(
        &self,
        pool_id: &str,
        user_id: &str,
        level_id: i64,
        turns_used: i64,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StorageError> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from_sqlx)?;

        // Step 1: already claimed?
        if let Some(row) = sqlx::query(
            "SELECT claim_id, user_id, level_id, pool_id, item_id, code_snapshot, claimed_at \
             FROM reward_claims WHERE user_id = ?1 AND level_id = ?2",
        )
        .bind(user_id)
        .bind(level_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StorageError::from_sqlx)?
        {
            let claim = rows::reward_claim_from_row(&row)?;
            tx.commit().await.map_err(StorageError::from_sqlx)?;
            return Ok(ClaimOutcome::AlreadyClaimed(claim));
        }

        // Step 2: ordered candidates (JD_ECARD first to exhaust one-shot
        // inventory, then item_id ascending).
        let candidate_rows = sqlx::query(
            "SELECT item_id, pool_id, kind, code, max_claims, claimed_count, enabled \
             FROM reward_items \
             WHERE pool_id = ?1 AND enabled = 1 AND (max_claims IS NULL OR claimed_count < max_claims) \
             ORDER BY (kind = 'JD_ECARD') DESC, item_id ASC \
             LIMIT ?2",
        )
        .bind(pool_id)
        .bind(MAX_CLAIM_CANDIDATES as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(StorageError::from_sqlx)?;

        if candidate_rows.is_empty() {
            tx.commit().await.map_err(StorageError::from_sqlx)?;
            return Ok(ClaimOutcome::PoolExhausted);
        }

        // Step 4: conditional update, retried across candidates.
        let mut claimed_item: Option<RewardItem> = None;
        for row in &candidate_rows {
            let item = rows::reward_item_from_row(row)?;
            let affected = sqlx::query(
                "UPDATE reward_items SET claimed_count = claimed_count + 1 \
                 WHERE item_id = ?1 AND (max_claims IS NULL OR claimed_count < max_claims)",
            )
            .bind(&item.item_id)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from_sqlx)?
            .rows_affected();

            if affected == 1 {
                claimed_item = Some(RewardItem {
                    claimed_count: item.claimed_count + 1,
                    ..item
                });
                break;
            }
        }

        let Some(item) = claimed_item else {
            tx.rollback().await.map_err(StorageError::from_sqlx)?;
            return Ok(ClaimOutcome::PoolExhausted);
        };

        // Step 5: insert claim.
        let claim = RewardClaim {
            claim_id: Uuid::new_v4(),
            user_id: user_id.to_owned(),
            level_id,
            pool_id: pool_id.to_owned(),
            item_id: item.item_id.clone(),
            code_snapshot: item.code.clone(),
            claimed_at: now,
        };
        sqlx::query(
            "INSERT INTO reward_claims (claim_id, user_id, level_id, pool_id, item_id, code_snapshot, claimed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(claim.claim_id.to_string())
        .bind(&claim.user_id)
        .bind(claim.level_id)
        .bind(&claim.pool_id)
        .bind(&claim.item_id)
        .bind(&claim.code_snapshot)
        .bind(claim.claimed_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from_sqlx)?;

        // Step 6: insert/ignore level progress.
        sqlx::query(
            "INSERT INTO level_progress (user_id, level_id, passed_at, turns_used) \
             VALUES (?1, ?2, ?3, ?4) ON CONFLICT(user_id, level_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(level_id)
        .bind(now.to_rfc3339())
        .bind(turns_used)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from_sqlx)?;

        tx.commit().await.map_err(StorageError::from_sqlx)?;
        Ok(ClaimOutcome::Claimed { claim, item })
    }

    async fn get_claim(&self, user_id: &str, level_id: i64) -> Result<Option<RewardClaim>, StorageError> {
        let row = sqlx::query(
            "SELECT claim_id, user_id, level_id, pool_id, item_id, code_snapshot, claimed_at \
             FROM reward_claims WHERE user_id = ?1 AND level_id = ?2",
        )
        .bind(user_id)
        .bind(level_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::from_sqlx)?;
        row.as_ref().map(rows::reward_claim_from_row).transpose()
    }

    async fn reload_reward_items(&self, pool_id: &str, pool_enabled: bool, items: &[RewardItemConfig]) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from_sqlx)?;
        let enabled = i64::from(pool_enabled);

        for item in items {
            let kind = item.kind.as_str();
            sqlx::query(
                "INSERT INTO reward_items (item_id, pool_id, kind, code, max_claims, claimed_count, enabled) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6) \
                 ON CONFLICT(item_id) DO UPDATE SET \
                   pool_id = excluded.pool_id, \
                   kind = excluded.kind, \
                   code = excluded.code, \
                   max_claims = excluded.max_claims, \
                   enabled = excluded.enabled",
            )
            .bind(&item.item_id)
            .bind(pool_id)
            .bind(kind)
            .bind(&item.code)
            .bind(item.max_claims)
            .bind(enabled)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from_sqlx)?;
        }

        let configured_ids: Vec<&str> = items.iter().map(|i| i.item_id.as_str()).collect();
        let existing = sqlx::query("SELECT item_id FROM reward_items WHERE pool_id = ?1")
            .bind(pool_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(StorageError::from_sqlx)?;

        for row in existing {
            let item_id: String = row.try_get("item_id").map_err(StorageError::from_sqlx)?;
            if !configured_ids.contains(&item_id.as_str()) {
                sqlx::query("UPDATE reward_items SET enabled = 0 WHERE item_id = ?1")
                    .bind(&item_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(StorageError::from_sqlx)?;
            }
        }

        tx.commit().await.map_err(StorageError::from_sqlx)?;
        Ok(())
    }

    async fn list_reward_items(&self, pool_id: &str) -> Result<Vec<RewardItem>, StorageError> {
        let db_rows = sqlx::query(
            "SELECT item_id, pool_id, kind, code, max_claims, claimed_count, enabled \
             FROM reward_items WHERE pool_id = ?1 ORDER BY item_id ASC",
        )
        .bind(pool_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::from_sqlx)?;
        db_rows.iter().map(rows::reward_item_from_row).collect()
    }

    async fn ban_user(&self, user_id: &str, reason: &str, now: DateTime<Utc>) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO bans (user_id, reason, banned_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(user_id) DO UPDATE SET reason = excluded.reason, banned_at = excluded.banned_at",
        )
        .bind(user_id)
        .bind(reason)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(StorageError::from_sqlx)?;
        Ok(())
    }

    async fn unban_user(&self, user_id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM bans WHERE user_id = ?1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(StorageError::from_sqlx)?;
        Ok(())
    }

    async fn is_banned(&self, user_id: &str) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 FROM bans WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::from_sqlx)?;
        Ok(row.is_some())
    }

    async fn reset_session(&self, user_id: &str, level_id: i64, now: DateTime<Utc>) -> Result<(), StorageError> {
        let session = Session::new_ready(user_id, level_id, now);
        self.upsert_session(&session).await
    }

    async fn stats(&self) -> Result<Stats, StorageError> {
        let queue_depth: i64 = sqlx::query("SELECT COUNT(*) AS c FROM pending_tasks")
            .fetch_one(&self.pool)
            .await
            .map_err(StorageError::from_sqlx)?
            .try_get("c")
            .map_err(StorageError::from_sqlx)?;

        let claims_today: i64 = sqlx::query(
            "SELECT COUNT(*) AS c FROM reward_claims WHERE date(claimed_at) = date('now')",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(StorageError::from_sqlx)?
        .try_get("c")
        .map_err(StorageError::from_sqlx)?;

        Ok(Stats {
            queue_depth,
            claims_today,
        })
    }

    async fn export_log_events(&self, date: NaiveDate) -> Result<Vec<LogEvent>, StorageError> {
        let db_rows = sqlx::query(
            "SELECT event_id, trace_id, event_type, user_id, level_id, turn_index, content, created_at \
             FROM log_events WHERE date(created_at) = ?1 ORDER BY created_at ASC",
        )
        .bind(date.format("%Y-%m-%d").to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::from_sqlx)?;
        db_rows.iter().map(rows::log_event_from_row).collect()
    }
}
