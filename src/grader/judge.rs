//! The judge stage: prompt construction and tolerant parsing of the LLM's
//! verdict response (spec §4.C.2).

use serde::Deserialize;

use crate::content::Level;
use crate::types::{truncate_chars, JudgeVerdict};

/// Intro text is truncated to this many characters before being embedded
/// in the judge prompt, keeping the prompt itself bounded.
const INTRO_TRUNCATE_CHARS: usize = 300;

/// Build the judge prompt for one attempt.
pub fn build_prompt(level: &Level, user_prompt: &str, llm_output: &str) -> String {
    let intro = truncate_chars(&level.intro_message, INTRO_TRUNCATE_CHARS);
    format!(
        "You are grading one attempt at a prompt-challenge level.\n\
         level_id: {level_id}\n\
         intro: {intro}\n\
         target_phrase: {target}\n\
         user_prompt: {user_prompt}\n\
         llm_output: {llm_output}\n\n\
         Reply with exactly one line of JSON: {{\"verdict\":\"PASS\"|\"FAIL\",\"reason\":\"...\"}}",
        level_id = level.level_id,
        target = target_phrase_hint(level),
    )
}

fn target_phrase_hint(level: &Level) -> &str {
    match &level.match_policy {
        crate::content::MatchPolicy::ExactSubstring(s)
        | crate::content::MatchPolicy::CaseInsensitiveSubstring(s) => s.as_str(),
        crate::content::MatchPolicy::Regex(re) => re.as_str(),
    }
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    verdict: String,
    #[serde(default)]
    reason: Option<String>,
}

/// Parse the judge's raw reply into a verdict and reason.
///
/// Strips leading/trailing whitespace and triple-backtick code fences
/// before attempting `serde_json::from_str`. Malformed JSON, or a
/// `verdict` field other than `PASS`/`FAIL`, yields `JudgeVerdict::Error`.
pub fn parse_verdict(raw: &str) -> (JudgeVerdict, Option<String>) {
    let cleaned = strip_code_fence(raw.trim());

    match serde_json::from_str::<RawVerdict>(cleaned) {
        Ok(v) => match v.verdict.as_str() {
            "PASS" => (JudgeVerdict::Pass, v.reason),
            "FAIL" => (JudgeVerdict::Fail, v.reason),
            other => (
                JudgeVerdict::Error,
                Some(format!("unrecognised verdict {other:?}")),
            ),
        },
        Err(e) => (JudgeVerdict::Error, Some(format!("unparseable judge output: {e}"))),
    }
}

fn strip_code_fence(s: &str) -> &str {
    let s = s
        .strip_prefix("```json")
        .or_else(|| s.strip_prefix("```"))
        .unwrap_or(s);
    s.strip_suffix("```").unwrap_or(s).trim()
}
