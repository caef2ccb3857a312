//! The Admission Front: validates inbound messages, serializes per-user
//! submission, and enqueues work (spec §4.G).

mod locks;

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::channel::{Channel, InboundMessage};
use crate::content::LoadedContent;
use crate::queue::PersistentQueue;
use crate::storage::{Storage, StorageError};
use crate::types::{LogEvent, LogEventType, PendingTask, Session, SessionState};

pub use locks::{LockPoisoned, PerUserLocks};

/// Max non-empty lines accepted in one submission.
const MAX_LINES: usize = 20;
/// Max consecutive identical characters accepted in one submission.
const MAX_REPEATED_RUN: usize = 200;

/// Errors from admission. Most rejections are not errors — they're
/// `Rejected` outcomes with an inline reply; this type covers storage
/// failures only.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// A storage call failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    /// The per-user lock map was poisoned by a panicking holder.
    #[error("{0}")]
    Lock(#[from] LockPoisoned),
}

/// Why a submission validation failed (spec §4.G step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    /// The submission had no non-whitespace content.
    Empty,
    /// The submission exceeded `max_input_chars`.
    TooLong,
    /// The submission had more than [`MAX_LINES`] lines.
    TooManyLines,
    /// The submission had a run of [`MAX_REPEATED_RUN`]+ identical characters.
    RepeatedCharacterRun,
}

/// Validate submitted text against a level's limits and the engine-wide
/// character-class policy.
pub fn validate_text(text: &str, max_input_chars: usize) -> Result<(), ValidationError> {
    if text.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    if text.chars().count() > max_input_chars {
        return Err(ValidationError::TooLong);
    }
    if text.lines().count() > MAX_LINES {
        return Err(ValidationError::TooManyLines);
    }
    if has_repeated_run(text, MAX_REPEATED_RUN) {
        return Err(ValidationError::RepeatedCharacterRun);
    }
    Ok(())
}

fn has_repeated_run(text: &str, limit: usize) -> bool {
    let mut last = None;
    let mut run = 0usize;
    for c in text.chars() {
        if Some(c) == last {
            run += 1;
            if run > limit {
                return true;
            }
        } else {
            last = Some(c);
            run = 1;
        }
    }
    false
}

/// Receives inbound messages, validates and admits them (spec §4.G).
pub struct AdmissionFront {
    storage: Arc<dyn Storage>,
    content: Arc<RwLock<LoadedContent>>,
    queue: Arc<PersistentQueue>,
    channel: Arc<dyn Channel>,
    locks: PerUserLocks,
}

impl AdmissionFront {
    /// Build an admission front from its collaborators.
    pub fn new(
        storage: Arc<dyn Storage>,
        content: Arc<RwLock<LoadedContent>>,
        queue: Arc<PersistentQueue>,
        channel: Arc<dyn Channel>,
    ) -> Self {
        Self {
            storage,
            content,
            queue,
            channel,
            locks: PerUserLocks::new(),
        }
    }

    /// Handle one inbound message end to end (spec §4.G).
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError`] only for storage failures. Every
    /// validation/state rejection is handled inline with a reply and
    /// returns `Ok(())`.
    pub async fn on_message(&self, msg: InboundMessage) -> Result<(), AdmissionError> {
        if self.storage.is_banned(&msg.user_id).await? {
            self.reply(&msg, "You are banned from this activity.").await;
            return Ok(());
        }

        self.storage.get_or_create_user(&msg.user_id, &msg.user_id).await?;

        let content = self.content.read().await;
        if !content.activity.enabled {
            drop(content);
            self.reply(&msg, "This activity is not currently active.").await;
            return Ok(());
        }

        let Some(level_id) = self.current_level(&msg.user_id, &content).await? else {
            drop(content);
            self.reply(&msg, "You've completed every level. Congratulations!").await;
            return Ok(());
        };
        let Some(level) = content.level(level_id).cloned() else {
            drop(content);
            self.reply(&msg, "This level is temporarily unavailable.").await;
            return Ok(());
        };
        drop(content);

        if !level.enabled {
            self.reply(&msg, "This level is temporarily unavailable.").await;
            return Ok(());
        }

        if let Err(validation) = validate_text(&msg.text, level.max_input_chars) {
            self.reply(&msg, validation_message(validation)).await;
            return Ok(());
        }

        let _guard = self.locks.acquire(&msg.user_id).await?;

        let now = Utc::now();
        let mut session = match self.storage.get_session(&msg.user_id, level_id).await? {
            Some(s) => s,
            None => Session::new_ready(&msg.user_id, level_id, now),
        };

        match session.state {
            SessionState::Inflight => {
                self.reply(&msg, "Your previous submission is still processing.").await;
                return Ok(());
            }
            SessionState::Cooldown => {
                if let Some(until) = session.cooldown_until {
                    if now < until {
                        let remaining = (until - now).num_seconds().max(0);
                        self.reply(&msg, &format!("Please wait {remaining}s before your next attempt.")).await;
                        return Ok(());
                    }
                }
            }
            SessionState::Passed => {
                self.reply(&msg, "You've already passed this level.").await;
                return Ok(());
            }
            SessionState::FailedOut => {
                self.reply(&msg, "You have no attempts remaining for this level.").await;
                return Ok(());
            }
            SessionState::Ready => {}
        }

        let trace_id = Uuid::new_v4();
        let task = PendingTask {
            task_id: Uuid::new_v4(),
            trace_id,
            user_id: msg.user_id.clone(),
            level_id,
            user_prompt: msg.text.clone(),
            enqueued_at: now,
        };
        session.state = SessionState::Inflight;
        session.inflight_task_id = Some(task.task_id);
        session.updated_at = now;

        let log_event = LogEvent::new(
            trace_id,
            LogEventType::UserIn,
            Some(msg.user_id.clone()),
            Some(level_id),
            Some(session.turn_index),
            msg.text.clone(),
            now,
        );

        self.storage.admit_task(&session, &task, &log_event).await?;
        self.queue.push_persisted(task).await;
        drop(_guard);

        let ahead = self.queue.len().await;
        self.reply(&msg, &format!("Queued — approximately {ahead} ahead of you.")).await;
        Ok(())
    }

    async fn current_level(&self, user_id: &str, content: &LoadedContent) -> Result<Option<i64>, StorageError> {
        for level in &content.levels {
            if !self.storage.is_level_passed(user_id, level.level_id).await? {
                return Ok(Some(level.level_id));
            }
        }
        Ok(None)
    }

    async fn reply(&self, msg: &InboundMessage, text: &str) {
        if let Err(e) = self.channel.send(&msg.chat_id, text).await {
            tracing::warn!(user_id = %msg.user_id, error = %e, "failed to send admission reply");
        }
    }
}

fn validation_message(err: ValidationError) -> &'static str {
    match err {
        ValidationError::Empty => "Your submission was empty.",
        ValidationError::TooLong => "Your submission is too long for this level.",
        ValidationError::TooManyLines => "Your submission has too many lines.",
        ValidationError::RepeatedCharacterRun => "Your submission has too long a run of repeated characters.",
    }
}
