//! `promptgate` — the gated, sequential prompt-challenge attempt-processing
//! engine: per-user session state machine, a crash-safe persistent queue,
//! a worker pool, a composite LLM grader, and an atomic reward-claim
//! protocol. The chat transport, LLM HTTP client, and config format are
//! abstracted behind the `channel`, `llm`, and `content` traits.

pub mod admin;
pub mod admission;
pub mod channel;
pub mod config;
pub mod content;
pub mod engine;
pub mod grader;
pub mod llm;
pub mod logging;
pub mod queue;
pub mod reward;
pub mod storage;
pub mod types;
pub mod worker;
