//! Per-attempt orchestration: LLM → Grader → Reward Claim → reply (spec
//! §4.E). [`GameEngine::process`] is the single entry point a worker calls
//! for each dequeued task, bundling the engine's collaborators into one
//! struct cloned into each task — the teacher's `telegram::SharedState`
//! convention, generalized from "chat session state" to "attempt engine
//! dependencies."

pub mod session_machine;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::channel::Channel;
use crate::content::{render_template, LoadedContent};
use crate::grader::Grader;
use crate::llm::LlmClient;
use crate::reward::{claim_reward, ClaimResult};
use crate::storage::{Storage, StorageError};
use crate::types::{
    Attempt, FinalVerdict, JudgeVerdict, LogEvent, LogEventType, PendingTask, Session, SessionState,
};

/// Errors from one `process` call. Every variant here is a defect in the
/// engine's own bookkeeping (storage failures); user-attributable and
/// transient outcomes are not errors — they're handled states that still
/// return `Ok(())`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A storage call failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Bundles the engine's collaborators (spec §4.E).
pub struct GameEngine {
    storage: Arc<dyn Storage>,
    content: Arc<RwLock<LoadedContent>>,
    grader: Arc<Grader>,
    llm: Arc<dyn LlmClient>,
    channel: Arc<dyn Channel>,
}

impl GameEngine {
    /// Build an engine from its collaborators.
    pub fn new(
        storage: Arc<dyn Storage>,
        content: Arc<RwLock<LoadedContent>>,
        grader: Arc<Grader>,
        llm: Arc<dyn LlmClient>,
        channel: Arc<dyn Channel>,
    ) -> Self {
        Self {
            storage,
            content,
            grader,
            llm,
            channel,
        }
    }

    /// Process one dequeued task to a terminal outcome (spec §4.E).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] only for storage failures; every
    /// user/grading-level outcome is represented as `Ok(())` with the
    /// appropriate session transition and reply already sent.
    pub async fn process(&self, task: PendingTask) -> Result<(), EngineError> {
        let now = Utc::now();

        let Some(mut session) = self.storage.get_session(&task.user_id, task.level_id).await? else {
            self.log_error(task.trace_id, &task, "no session for pending task", now).await?;
            self.storage.delete_task(task.task_id).await?;
            return Ok(());
        };
        if session.state != SessionState::Inflight {
            self.log_error(task.trace_id, &task, "session not INFLIGHT for pending task", now).await?;
            self.storage.delete_task(task.task_id).await?;
            return Ok(());
        }

        let content = self.content.read().await;
        let Some(level) = content.level(task.level_id).cloned() else {
            drop(content);
            self.log_error(task.trace_id, &task, "pending task references unknown level", now).await?;
            self.storage.delete_task(task.task_id).await?;
            return Ok(());
        };
        let timeout = Duration::from_secs(content.activity.llm_timeout_seconds);
        drop(content);

        let generated = tokio::time::timeout(
            timeout,
            self.llm.generate(&level.system_prompt, &task.user_prompt, level.max_output_tokens),
        )
        .await;

        let llm_output = match generated {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return self
                    .finish_transient(&task, &mut session, "", JudgeVerdict::Error, Some(e.to_string()), false, now)
                    .await;
            }
            Err(_) => {
                return self
                    .finish_transient(&task, &mut session, "", JudgeVerdict::Error, Some("llm generate timed out".into()), false, now)
                    .await;
            }
        };

        let grade = tokio::time::timeout(timeout, self.grader.grade(&level, &task.user_prompt, &llm_output)).await;
        let grade = match grade {
            Ok(Ok(g)) => g,
            Ok(Err(e)) => {
                return self
                    .finish_transient(&task, &mut session, &llm_output, JudgeVerdict::Error, Some(e.to_string()), false, now)
                    .await;
            }
            Err(_) => {
                return self
                    .finish_transient(&task, &mut session, &llm_output, JudgeVerdict::Error, Some("judge call timed out".into()), false, now)
                    .await;
            }
        };

        if grade.judge_verdict == JudgeVerdict::Error {
            return self
                .finish_transient(
                    &task,
                    &mut session,
                    &llm_output,
                    JudgeVerdict::Error,
                    grade.judge_reason.clone(),
                    grade.keyword_pass,
                    now,
                )
                .await;
        }

        let attempt = Attempt {
            attempt_id: Uuid::new_v4(),
            trace_id: task.trace_id,
            user_id: task.user_id.clone(),
            level_id: task.level_id,
            turn_index: session.turn_index,
            user_prompt: task.user_prompt.clone(),
            llm_output: llm_output.clone(),
            keyword_pass: grade.keyword_pass,
            judge_verdict: grade.judge_verdict.clone(),
            judge_reason: grade.judge_reason.clone(),
            final_verdict: grade.final_verdict,
            created_at: now,
        };
        self.storage.record_attempt(&attempt).await?;

        let reply = match grade.final_verdict {
            FinalVerdict::Pass => self.handle_pass(&task, &level, &mut session, now).await?,
            FinalVerdict::Fail => {
                session_machine::transition_fail(&mut session, &level, now);
                if session.state == SessionState::FailedOut {
                    "You're out of attempts for this level.".to_owned()
                } else {
                    format!(
                        "Not quite — attempt {} of {}. Try again in {}s.",
                        session.turn_index, level.max_turns, level.cooldown_seconds_after_fail
                    )
                }
            }
        };

        self.storage.upsert_session(&session).await?;
        self.storage.delete_task(task.task_id).await?;
        self.append_system_log(task.trace_id, &task, &reply, now).await?;
        self.append_grade_log(&task, &grade, now).await?;

        if let Err(e) = self.channel.send(&task.user_id, &reply).await {
            tracing::warn!(user_id = %task.user_id, error = %e, "failed to deliver reply");
        }

        Ok(())
    }

    /// Recover from a fatal (non-grading) failure of [`Self::process`]:
    /// delete the pending task so it never replays, and release the
    /// session back to READY without consuming a turn (spec §7 "Fatal
    /// errors"). Called by the worker loop when `process` itself returns
    /// `Err`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the recovery writes themselves fail —
    /// the worker logs and moves on regardless.
    pub async fn recover_fatal(&self, task_id: Uuid, user_id: &str, level_id: i64) -> Result<(), EngineError> {
        if let Some(mut session) = self.storage.get_session(user_id, level_id).await? {
            if session.state == SessionState::Inflight {
                session_machine::transition_transient(&mut session, Utc::now());
                self.storage.upsert_session(&session).await?;
            }
        }
        self.storage.delete_task(task_id).await?;
        Ok(())
    }

    async fn handle_pass(
        &self,
        task: &PendingTask,
        level: &crate::content::Level,
        session: &mut Session,
        now: chrono::DateTime<Utc>,
    ) -> Result<String, EngineError> {
        let content = self.content.read().await;
        let pool = content.pool(&level.reward_pool_id).cloned();
        drop(content);

        let pool_enabled = pool.as_ref().map(|p| p.enabled).unwrap_or(false);

        // An already-claimed user keeps their code even if the pool is
        // disabled after the fact; a fresh claim against a disabled pool is
        // treated the same as exhaustion.
        let claim = if pool_enabled {
            claim_reward(
                self.storage.as_ref(),
                &level.reward_pool_id,
                &task.user_id,
                task.level_id,
                session.turn_index,
                now,
            )
            .await
            .map_err(|e| EngineError::Storage(match e {
                crate::reward::ClaimError::Storage(s) => s,
            }))?
        } else {
            match self.storage.get_claim(&task.user_id, task.level_id).await? {
                Some(existing) => ClaimResult::AlreadyClaimed(existing),
                None => {
                    self.storage.mark_level_passed(&task.user_id, task.level_id, session.turn_index, now).await?;
                    ClaimResult::PoolExhausted
                }
            }
        };

        session_machine::transition_pass(session, now);

        let reply = match claim {
            ClaimResult::Claimed { item, .. } => {
                let template = pool.as_ref().map(|p| p.send_message_template.as_str()).unwrap_or("You passed! Code: {reward_code}");
                render_template(template, &item.code, level.level_id, &level.name, &task.user_id)
            }
            ClaimResult::AlreadyClaimed(claim) => {
                format!("You already claimed this level's reward: {}", claim.code_snapshot)
            }
            ClaimResult::PoolExhausted => {
                "You passed this level, but its rewards are exhausted — congratulations anyway!".to_owned()
            }
        };

        Ok(reply)
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_transient(
        &self,
        task: &PendingTask,
        session: &mut Session,
        llm_output: &str,
        judge_verdict: JudgeVerdict,
        reason: Option<String>,
        keyword_pass: bool,
        now: chrono::DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let attempt = Attempt {
            attempt_id: Uuid::new_v4(),
            trace_id: task.trace_id,
            user_id: task.user_id.clone(),
            level_id: task.level_id,
            turn_index: session.turn_index,
            user_prompt: task.user_prompt.clone(),
            llm_output: llm_output.to_owned(),
            keyword_pass,
            judge_verdict,
            judge_reason: reason,
            final_verdict: FinalVerdict::Fail,
            created_at: now,
        };
        self.storage.record_attempt(&attempt).await?;

        session_machine::transition_transient(session, now);
        self.storage.upsert_session(session).await?;
        self.storage.delete_task(task.task_id).await?;

        let reply = "System busy, please try again.";
        self.append_system_log(task.trace_id, task, reply, now).await?;

        if let Err(e) = self.channel.send(&task.user_id, reply).await {
            tracing::warn!(user_id = %task.user_id, error = %e, "failed to deliver transient-error reply");
        }
        Ok(())
    }

    async fn append_system_log(
        &self,
        trace_id: Uuid,
        task: &PendingTask,
        content: &str,
        now: chrono::DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let event = LogEvent::new(
            trace_id,
            LogEventType::SystemOut,
            Some(task.user_id.clone()),
            Some(task.level_id),
            None,
            content,
            now,
        );
        self.storage.append_log_event(&event).await?;
        Ok(())
    }

    async fn append_grade_log(
        &self,
        task: &PendingTask,
        grade: &crate::grader::GradeResult,
        now: chrono::DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let summary = format!(
            "keyword={} judge={} final={}",
            grade.keyword_pass,
            grade.judge_verdict.as_str(),
            grade.final_verdict.as_str()
        );
        let event = LogEvent::new(
            task.trace_id,
            LogEventType::Grade,
            Some(task.user_id.clone()),
            Some(task.level_id),
            None,
            summary,
            now,
        );
        self.storage.append_log_event(&event).await?;
        Ok(())
    }

    async fn log_error(
        &self,
        trace_id: Uuid,
        task: &PendingTask,
        message: &str,
        now: chrono::DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let event = LogEvent::new(
            trace_id,
            LogEventType::Error,
            Some(task.user_id.clone()),
            Some(task.level_id),
            None,
            message,
            now,
        );
        self.storage.append_log_event(&event).await?;
        Ok(())
    }
}
