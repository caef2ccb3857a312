use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use promptgate::channel::{Channel, ChannelError};
use promptgate::content::{Level, LoadedContent, MatchPolicy, RewardItemConfig, RewardPool};
use promptgate::engine::GameEngine;
use promptgate::grader::Grader;
use promptgate::llm::{LlmClient, LlmError};
use promptgate::storage::{SqliteStorage, Storage};
use promptgate::types::{PendingTask, RewardKind, Session, SessionState};
use tokio::sync::RwLock;
use uuid::Uuid;

struct FakeChannel {
    sent: Mutex<Vec<(String, String)>>,
}

impl FakeChannel {
    fn new() -> Self {
        Self { sent: Mutex::new(Vec::new()) }
    }

    fn last(&self) -> (String, String) {
        self.sent.lock().expect("lock failed").last().cloned().expect("nothing sent")
    }
}

#[async_trait]
impl Channel for FakeChannel {
    async fn send(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        self.sent.lock().expect("lock failed").push((chat_id.to_owned(), text.to_owned()));
        Ok(())
    }
}

struct FakeLlmClient {
    generate_delay: Duration,
    generate_ok: Option<String>,
    judge_delay: Duration,
    judge_ok: Option<String>,
}

impl FakeLlmClient {
    fn passing(output: &str) -> Self {
        Self {
            generate_delay: Duration::ZERO,
            generate_ok: Some(output.to_owned()),
            judge_delay: Duration::ZERO,
            judge_ok: Some(r#"{"verdict":"PASS","reason":"matched"}"#.to_owned()),
        }
    }

    fn failing(output: &str) -> Self {
        Self {
            generate_delay: Duration::ZERO,
            generate_ok: Some(output.to_owned()),
            judge_delay: Duration::ZERO,
            judge_ok: Some(r#"{"verdict":"FAIL","reason":"nope"}"#.to_owned()),
        }
    }

    fn generate_errors() -> Self {
        Self {
            generate_delay: Duration::ZERO,
            generate_ok: None,
            judge_delay: Duration::ZERO,
            judge_ok: None,
        }
    }

    fn judge_malformed(output: &str) -> Self {
        Self {
            generate_delay: Duration::ZERO,
            generate_ok: Some(output.to_owned()),
            judge_delay: Duration::ZERO,
            judge_ok: Some("not json".to_owned()),
        }
    }

    fn generate_slow(output: &str, delay: Duration) -> Self {
        Self {
            generate_delay: delay,
            generate_ok: Some(output.to_owned()),
            judge_delay: Duration::ZERO,
            judge_ok: Some(r#"{"verdict":"PASS","reason":"matched"}"#.to_owned()),
        }
    }
}

#[async_trait]
impl LlmClient for FakeLlmClient {
    async fn generate(&self, _system_prompt: &str, _user_prompt: &str, _max_output_tokens: u32) -> Result<String, LlmError> {
        if !self.generate_delay.is_zero() {
            tokio::time::sleep(self.generate_delay).await;
        }
        match &self.generate_ok {
            Some(s) => Ok(s.clone()),
            None => Err(LlmError::Api { status: 500, body: "boom".to_owned() }),
        }
    }

    async fn judge(&self, _prompt: &str, _max_output_tokens: u32) -> Result<String, LlmError> {
        if !self.judge_delay.is_zero() {
            tokio::time::sleep(self.judge_delay).await;
        }
        match &self.judge_ok {
            Some(s) => Ok(s.clone()),
            None => Err(LlmError::Api { status: 500, body: "boom".to_owned() }),
        }
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
        max_turns: 2,
        cooldown_seconds_after_fail: 30,
        max_output_tokens: 256,
        match_policy: MatchPolicy::ExactSubstring("SYN-ACK".to_owned()),
        judge_enabled: true,
        reward_pool_id: "pool1".to_owned(),
    }
}

fn sample_content(llm_timeout_seconds: u64) -> LoadedContent {
    LoadedContent {
        activity: promptgate::content::Activity {
            activity_id: "a1".to_owned(),
            enabled: true,
            start_at: Utc::now() - chrono::Duration::days(1),
            end_at: Utc::now() + chrono::Duration::days(1),
            channel_name: "telegram".to_owned(),
            max_inflight_per_user: 1,
            queue_max_length: 100,
            worker_concurrency: 1,
            llm_model: "test-model".to_owned(),
            llm_timeout_seconds,
            llm_default_max_output_tokens: 256,
        },
        levels: vec![sample_level()],
        pools: vec![RewardPool {
            pool_id: "pool1".to_owned(),
            enabled: true,
            send_message_template: "Code: {reward_code}".to_owned(),
            items: vec![RewardItemConfig {
                item_id: "a".to_owned(),
                kind: RewardKind::AlipayCode,
                code: "CODE-A".to_owned(),
                max_claims: Some(5),
            }],
        }],
    }
}

fn engine(
    storage: Arc<dyn Storage>,
    content: LoadedContent,
    llm: FakeLlmClient,
    channel: Arc<FakeChannel>,
) -> (GameEngine, Arc<dyn LlmClient>) {
    let llm: Arc<dyn LlmClient> = Arc::new(llm);
    let grader = Arc::new(Grader::new(Arc::clone(&llm)));
    let content = Arc::new(RwLock::new(content));
    let channel: Arc<dyn Channel> = channel;
    (GameEngine::new(Arc::clone(&storage), content, grader, Arc::clone(&llm), channel), llm)
}

#[tokio::test]
async fn successful_pass_claims_reward_and_sends_code() {
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed"));
    let now = Utc::now();
    let task = inflight_task_with(&storage, now).await;
    let channel = Arc::new(FakeChannel::new());
    let (engine, _llm) = engine(Arc::clone(&storage), sample_content(5), FakeLlmClient::passing("SYN-ACK established"), Arc::clone(&channel));

    engine.process(task).await.expect("process failed");

    let session = storage.get_session("u1", 1).await.expect("get_session query failed").expect("session should exist");
    assert_eq!(session.state, SessionState::Passed);
    let (chat, text) = channel.last();
    assert_eq!(chat, "u1");
    assert!(text.contains("CODE-A"), "reply should contain the claimed code: {text}");
}

#[tokio::test]
async fn pass_against_disabled_pool_skips_claim_but_still_passes() {
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed"));
    let now = Utc::now();
    let task = inflight_task_with(&storage, now).await;
    let channel = Arc::new(FakeChannel::new());
    let mut content = sample_content(5);
    content.pools[0].enabled = false;
    let (engine, _llm) = engine(Arc::clone(&storage), content, FakeLlmClient::passing("SYN-ACK established"), Arc::clone(&channel));

    engine.process(task).await.expect("process failed");

    let session = storage.get_session("u1", 1).await.expect("get_session query failed").expect("session should exist");
    assert_eq!(session.state, SessionState::Passed);
    assert!(storage.is_level_passed("u1", 1).await.expect("is_level_passed failed"));
    assert!(storage.get_claim("u1", 1).await.expect("get_claim failed").is_none(), "a disabled pool must not dispense a claim");
    let (_, text) = channel.last();
    assert!(text.to_lowercase().contains("exhausted"), "{text}");
}

#[tokio::test]
async fn fail_below_max_turns_goes_to_cooldown() {
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed"));
    let now = Utc::now();
    let task = inflight_task_with(&storage, now).await;
    let channel = Arc::new(FakeChannel::new());
    let (engine, _llm) = engine(Arc::clone(&storage), sample_content(5), FakeLlmClient::failing("handshake refused"), Arc::clone(&channel));

    engine.process(task).await.expect("process failed");

    let session = storage.get_session("u1", 1).await.expect("get_session query failed").expect("session should exist");
    assert_eq!(session.state, SessionState::Cooldown);
    assert_eq!(session.turn_index, 1);
}

#[tokio::test]
async fn fail_at_max_turns_goes_to_failed_out() {
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed"));
    let now = Utc::now();
    let mut task = inflight_task_with(&storage, now).await;
    {
        let mut session = storage.get_session("u1", 1).await.expect("get_session query failed").expect("session should exist");
        session.turn_index = 1;
        storage.upsert_session(&session).await.expect("upsert_session failed");
    }
    // re-enqueue is not required — engine reads current session state by (user, level).
    task.enqueued_at = now;
    let channel = Arc::new(FakeChannel::new());
    let (engine, _llm) = engine(Arc::clone(&storage), sample_content(5), FakeLlmClient::failing("handshake refused"), Arc::clone(&channel));

    engine.process(task).await.expect("process failed");

    let session = storage.get_session("u1", 1).await.expect("get_session query failed").expect("session should exist");
    assert_eq!(session.state, SessionState::FailedOut);
    let (_, text) = channel.last();
    assert!(text.to_lowercase().contains("out of attempts"));
}

#[tokio::test]
async fn llm_generate_failure_recovers_session_to_ready() {
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed"));
    let now = Utc::now();
    let task = inflight_task_with(&storage, now).await;
    let channel = Arc::new(FakeChannel::new());
    let (engine, _llm) = engine(Arc::clone(&storage), sample_content(5), FakeLlmClient::generate_errors(), Arc::clone(&channel));

    engine.process(task).await.expect("process failed");

    let session = storage.get_session("u1", 1).await.expect("get_session query failed").expect("session should exist");
    assert_eq!(session.state, SessionState::Ready, "transient failures never consume a turn");
    assert_eq!(session.turn_index, 0);
}

#[tokio::test]
async fn malformed_judge_output_recovers_session_to_ready() {
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed"));
    let now = Utc::now();
    let task = inflight_task_with(&storage, now).await;
    let channel = Arc::new(FakeChannel::new());
    let (engine, _llm) = engine(
        Arc::clone(&storage),
        sample_content(5),
        FakeLlmClient::judge_malformed("SYN-ACK"),
        Arc::clone(&channel),
    );

    engine.process(task).await.expect("process failed");

    let session = storage.get_session("u1", 1).await.expect("get_session query failed").expect("session should exist");
    assert_eq!(session.state, SessionState::Ready);
}

#[tokio::test]
async fn llm_generate_timeout_recovers_session_to_ready() {
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed"));
    let now = Utc::now();
    let task = inflight_task_with(&storage, now).await;
    let channel = Arc::new(FakeChannel::new());
    // 1-second configured timeout, but the fake LLM sleeps far longer.
    let (engine, _llm) = engine(
        Arc::clone(&storage),
        sample_content(1),
        FakeLlmClient::generate_slow("SYN-ACK", Duration::from_secs(5)),
        Arc::clone(&channel),
    );

    engine.process(task).await.expect("process failed");

    let session = storage.get_session("u1", 1).await.expect("get_session query failed").expect("session should exist");
    assert_eq!(session.state, SessionState::Ready);
}

#[tokio::test]
async fn recover_fatal_deletes_task_and_returns_inflight_session_to_ready() {
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed"));
    let now = Utc::now();
    let task = inflight_task_with(&storage, now).await;
    let channel = Arc::new(FakeChannel::new());
    let (engine, _llm) = engine(Arc::clone(&storage), sample_content(5), FakeLlmClient::passing("SYN-ACK"), channel);

    engine.recover_fatal(task.task_id, &task.user_id, task.level_id).await.expect("recover_fatal failed");

    let session = storage.get_session("u1", 1).await.expect("get_session query failed").expect("session should exist");
    assert_eq!(session.state, SessionState::Ready, "a fatal error never consumes a turn");
    assert_eq!(session.turn_index, 0);
    let pending = storage.list_pending_tasks_ordered().await.expect("list_pending_tasks_ordered failed");
    assert!(pending.is_empty(), "the task row must not survive to replay");
}

#[tokio::test]
async fn pending_task_without_session_is_deleted_without_panicking() {
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed"));
    let task = PendingTask {
        task_id: Uuid::new_v4(),
        trace_id: Uuid::new_v4(),
        user_id: "ghost".to_owned(),
        level_id: 1,
        user_prompt: "hello".to_owned(),
        enqueued_at: Utc::now(),
    };
    let channel = Arc::new(FakeChannel::new());
    let (engine, _llm) = engine(Arc::clone(&storage), sample_content(5), FakeLlmClient::passing("SYN-ACK"), channel);

    engine.process(task).await.expect("process failed");
}

#[tokio::test]
async fn pending_task_with_non_inflight_session_is_deleted_without_panicking() {
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed"));
    let now = Utc::now();
    let session = Session::new_ready("u1", 1, now);
    storage.upsert_session(&session).await.expect("upsert_session failed");
    let task = PendingTask {
        task_id: Uuid::new_v4(),
        trace_id: Uuid::new_v4(),
        user_id: "u1".to_owned(),
        level_id: 1,
        user_prompt: "hello".to_owned(),
        enqueued_at: now,
    };
    let channel = Arc::new(FakeChannel::new());
    let (engine, _llm) = engine(Arc::clone(&storage), sample_content(5), FakeLlmClient::passing("SYN-ACK"), channel);

    engine.process(task).await.expect("process failed");

    let session = storage.get_session("u1", 1).await.expect("get_session query failed").expect("session should exist");
    assert_eq!(session.state, SessionState::Ready, "untouched — the task was simply discarded");
}

async fn inflight_task_with(storage: &Arc<dyn Storage>, now: chrono::DateTime<Utc>) -> PendingTask {
    let task = PendingTask {
        task_id: Uuid::new_v4(),
        trace_id: Uuid::new_v4(),
        user_id: "u1".to_owned(),
        level_id: 1,
        user_prompt: "give me the handshake".to_owned(),
        enqueued_at: now,
    };
    let mut session = Session::new_ready("u1", 1, now);
    session.state = SessionState::Inflight;
    session.inflight_task_id = Some(task.task_id);
    let event = promptgate::types::LogEvent::new(
        task.trace_id,
        promptgate::types::LogEventType::UserIn,
        Some("u1".to_owned()),
        Some(1),
        Some(session.turn_index),
        task.user_prompt.clone(),
        now,
    );
    storage.admit_task(&session, &task, &event).await.expect("admit_task failed");
    task
}
