//! The keyword stage: a pure, synchronous match of `llm_output` against a
//! level's configured `MatchPolicy` (spec §4.C.1).

use crate::content::MatchPolicy;

/// Whether `llm_output` satisfies `policy`.
pub fn keyword_pass(policy: &MatchPolicy, llm_output: &str) -> bool {
    policy.matches(llm_output)
}
