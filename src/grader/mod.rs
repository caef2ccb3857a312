//! The composite grader: a pure keyword matcher plus an LLM judge call,
//! combined into one verdict (spec §4.C).

pub mod judge;
pub mod keyword;

use std::sync::Arc;

use thiserror::Error;

use crate::content::Level;
use crate::llm::LlmClient;
use crate::types::{FinalVerdict, JudgeVerdict};

/// Errors from the judge stage. Malformed judge output is not an error
/// here — it's represented as `JudgeVerdict::Error` inside a successful
/// `GradeResult`, since the engine treats it as a transient system
/// condition, not a grading failure.
#[derive(Debug, Error)]
pub enum GraderError {
    /// The underlying LLM call failed (timeout, transport, non-2xx).
    #[error("judge call failed: {0}")]
    Llm(#[from] crate::llm::LlmError),
}

/// The full output of one `Grade` call (spec §4.C).
#[derive(Debug, Clone)]
pub struct GradeResult {
    /// Whether the keyword stage matched.
    pub keyword_pass: bool,
    /// The judge stage's verdict.
    pub judge_verdict: JudgeVerdict,
    /// The judge's stated reason, if it returned one.
    pub judge_reason: Option<String>,
    /// The combined verdict.
    pub final_verdict: FinalVerdict,
}

/// Composes the keyword matcher and the LLM judge into one verdict.
pub struct Grader {
    llm: Arc<dyn LlmClient>,
}

impl Grader {
    /// Build a grader backed by `llm` for the judge stage.
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Grade one attempt (spec §4.C). The judge is always invoked, even
    /// when the keyword stage already failed, so logs capture both signals.
    ///
    /// # Errors
    ///
    /// Returns [`GraderError`] if the judge LLM call itself fails
    /// (timeout/transport) — distinct from the judge *answering* with
    /// unparseable content, which yields `JudgeVerdict::Error` instead.
    pub async fn grade(
        &self,
        level: &Level,
        user_prompt: &str,
        llm_output: &str,
    ) -> Result<GradeResult, GraderError> {
        let keyword_pass = keyword::keyword_pass(&level.match_policy, llm_output);

        let judge_prompt = judge::build_prompt(level, user_prompt, llm_output);
        let raw = self
            .llm
            .judge(&judge_prompt, level.max_output_tokens)
            .await?;
        let (judge_verdict, judge_reason) = judge::parse_verdict(&raw);

        let final_verdict = if keyword_pass && judge_verdict == JudgeVerdict::Pass {
            FinalVerdict::Pass
        } else {
            FinalVerdict::Fail
        };

        Ok(GradeResult {
            keyword_pass,
            judge_verdict,
            judge_reason,
            final_verdict,
        })
    }
}
