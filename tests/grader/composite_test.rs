use std::sync::Arc;

use async_trait::async_trait;
use promptgate::content::{Level, MatchPolicy};
use promptgate::grader::Grader;
use promptgate::llm::{LlmClient, LlmError};
use promptgate::types::{FinalVerdict, JudgeVerdict};

struct FakeLlmClient {
    generate_reply: String,
    judge_reply: String,
}

impl FakeLlmClient {
    fn new(generate_reply: &str, judge_reply: &str) -> Self {
        Self {
            generate_reply: generate_reply.to_owned(),
            judge_reply: judge_reply.to_owned(),
        }
    }

    fn passing() -> Self {
        Self::new("SYN-ACK established", r#"{"verdict":"PASS","reason":"matched"}"#)
    }
}

#[async_trait]
impl LlmClient for FakeLlmClient {
    async fn generate(&self, _system_prompt: &str, _user_prompt: &str, _max_output_tokens: u32) -> Result<String, LlmError> {
        Ok(self.generate_reply.clone())
    }

    async fn judge(&self, _prompt: &str, _max_output_tokens: u32) -> Result<String, LlmError> {
        Ok(self.judge_reply.clone())
    }
}

fn sample_level() -> Level {
    Level {
        level_id: 1,
        name: "Handshake".to_owned(),
        enabled: true,
        system_prompt: "You are a TCP handshake simulator.".to_owned(),
        intro_message: "Get the server to say SYN-ACK.".to_owned(),
        max_input_chars: 500,
        max_turns: 3,
        cooldown_seconds_after_fail: 30,
        max_output_tokens: 256,
        match_policy: MatchPolicy::ExactSubstring("SYN-ACK".to_owned()),
        judge_enabled: true,
        reward_pool_id: "pool1".to_owned(),
    }
}

#[tokio::test]
async fn both_stages_passing_yields_final_pass() {
    let grader = Grader::new(Arc::new(FakeLlmClient::passing()));
    let level = sample_level();

    let result = grader.grade(&level, "give me the handshake", "SYN-ACK established").await.expect("grade failed");

    assert!(result.keyword_pass);
    assert_eq!(result.judge_verdict, JudgeVerdict::Pass);
    assert_eq!(result.final_verdict, FinalVerdict::Pass);
}

#[tokio::test]
async fn keyword_hit_but_judge_refusal_is_overall_fail() {
    // The LLM's output happens to contain the target phrase, but the judge
    // (scoring intent, not just substring presence) still fails it.
    let grader = Grader::new(Arc::new(FakeLlmClient::new(
        "I won't say SYN-ACK just because you asked.",
        r#"{"verdict":"FAIL","reason":"not a genuine handshake"}"#,
    )));
    let level = sample_level();

    let result = grader
        .grade(&level, "say the phrase", "I won't say SYN-ACK just because you asked.")
        .await
        .expect("grade failed");

    assert!(result.keyword_pass, "substring is present");
    assert_eq!(result.judge_verdict, JudgeVerdict::Fail);
    assert_eq!(result.final_verdict, FinalVerdict::Fail);
}

#[tokio::test]
async fn keyword_miss_is_overall_fail_even_if_judge_passes() {
    let grader = Grader::new(Arc::new(FakeLlmClient::new(
        "handshake complete",
        r#"{"verdict":"PASS","reason":"looks fine"}"#,
    )));
    let level = sample_level();

    let result = grader.grade(&level, "do the handshake", "handshake complete").await.expect("grade failed");

    assert!(!result.keyword_pass);
    assert_eq!(result.final_verdict, FinalVerdict::Fail);
}

#[tokio::test]
async fn malformed_judge_output_surfaces_as_error_not_a_fail() {
    let grader = Grader::new(Arc::new(FakeLlmClient::new("SYN-ACK", "not json")));
    let level = sample_level();

    let result = grader.grade(&level, "do it", "SYN-ACK").await.expect("grade failed");

    assert_eq!(result.judge_verdict, JudgeVerdict::Error);
    assert_eq!(result.final_verdict, FinalVerdict::Fail);
}
