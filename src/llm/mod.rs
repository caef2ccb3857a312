//! The `LLM.Generate` / `LLM.Judge` collaborator (spec §2, §6).
//!
//! Both calls are modeled as one trait so the engine and grader depend on
//! an abstraction, not a concrete HTTP client — matching the teacher's
//! `providers` trait-per-backend pattern, narrowed here to a single
//! concrete implementation since only one backend is in scope.

pub mod http;

use async_trait::async_trait;
use thiserror::Error;

/// Errors calling the LLM collaborator. Both variants map to a transient
/// failure in the engine (spec §4.E step 2, §7).
#[derive(Debug, Error)]
pub enum LlmError {
    /// The call did not complete within the configured timeout.
    #[error("llm call timed out")]
    Timeout,
    /// A network/transport-level failure.
    #[error("llm transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The API responded with a non-success status.
    #[error("llm api error (status {status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated for logging.
        body: String,
    },
}

/// Abstract LLM collaborator.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate the challenge response for a user's submission.
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_output_tokens: u32,
    ) -> Result<String, LlmError>;

    /// Ask the judge model to grade an attempt, returning its raw reply
    /// text (parsed by [`crate::grader::judge::parse_verdict`]).
    async fn judge(&self, prompt: &str, max_output_tokens: u32) -> Result<String, LlmError>;
}
