use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use promptgate::admission::AdmissionFront;
use promptgate::channel::{Channel, ChannelError, InboundMessage};
use promptgate::content::{Activity, Level, LoadedContent, MatchPolicy, RewardPool};
use promptgate::queue::PersistentQueue;
use promptgate::storage::{SqliteStorage, Storage};
use promptgate::types::{Session, SessionState};
use tokio::sync::RwLock;

struct FakeChannel {
    sent: Mutex<Vec<(String, String)>>,
}

impl FakeChannel {
    fn new() -> Self {
        Self { sent: Mutex::new(Vec::new()) }
    }

    fn last_text(&self) -> String {
        self.sent.lock().expect("lock failed").last().cloned().expect("nothing sent").1
    }
}

#[async_trait]
impl Channel for FakeChannel {
    async fn send(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        self.sent.lock().expect("lock failed").push((chat_id.to_owned(), text.to_owned()));
        Ok(())
    }
}

fn sample_level(level_id: i64, max_input_chars: usize) -> Level {
    Level {
        level_id,
        name: format!("Level {level_id}"),
        enabled: true,
        system_prompt: "sys".to_owned(),
        intro_message: "intro".to_owned(),
        max_input_chars,
        max_turns: 3,
        cooldown_seconds_after_fail: 30,
        max_output_tokens: 256,
        match_policy: MatchPolicy::ExactSubstring("X".to_owned()),
        judge_enabled: true,
        reward_pool_id: "pool1".to_owned(),
    }
}

fn sample_content(enabled: bool, levels: Vec<Level>) -> LoadedContent {
    LoadedContent {
        activity: Activity {
            activity_id: "a1".to_owned(),
            enabled,
            start_at: Utc::now() - chrono::Duration::days(1),
            end_at: Utc::now() + chrono::Duration::days(1),
            channel_name: "telegram".to_owned(),
            max_inflight_per_user: 1,
            queue_max_length: 100,
            worker_concurrency: 1,
            llm_model: "test-model".to_owned(),
            llm_timeout_seconds: 5,
            llm_default_max_output_tokens: 256,
        },
        levels,
        pools: vec![RewardPool {
            pool_id: "pool1".to_owned(),
            enabled: true,
            send_message_template: "Code: {reward_code}".to_owned(),
            items: vec![],
        }],
    }
}

fn msg(user_id: &str, text: &str) -> InboundMessage {
    InboundMessage {
        user_id: user_id.to_owned(),
        chat_id: user_id.to_owned(),
        message_id: 1,
        text: text.to_owned(),
        timestamp: Utc::now(),
    }
}

fn front(storage: Arc<dyn Storage>, content: LoadedContent, queue: Arc<PersistentQueue>, channel: Arc<FakeChannel>) -> AdmissionFront {
    let channel: Arc<dyn Channel> = channel;
    AdmissionFront::new(storage, Arc::new(RwLock::new(content)), queue, channel)
}

#[tokio::test]
async fn banned_user_is_rejected_without_enqueue() {
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed"));
    storage.ban_user("u1", "cheating", Utc::now()).await.expect("ban_user failed");
    let channel = Arc::new(FakeChannel::new());
    let queue = PersistentQueue::new(10);
    let front = front(Arc::clone(&storage), sample_content(true, vec![sample_level(1, 500)]), Arc::clone(&queue), Arc::clone(&channel));

    front.on_message(msg("u1", "hello")).await.expect("on_message failed");

    assert!(channel.last_text().to_lowercase().contains("banned"));
    assert_eq!(queue.len().await, 0);
}

#[tokio::test]
async fn disabled_activity_rejects_submission() {
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed"));
    let channel = Arc::new(FakeChannel::new());
    let queue = PersistentQueue::new(10);
    let front = front(Arc::clone(&storage), sample_content(false, vec![sample_level(1, 500)]), Arc::clone(&queue), Arc::clone(&channel));

    front.on_message(msg("u1", "hello")).await.expect("on_message failed");

    assert!(channel.last_text().to_lowercase().contains("not currently active"));
    assert_eq!(queue.len().await, 0);
}

#[tokio::test]
async fn disabled_level_rejects_submission() {
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed"));
    let mut level = sample_level(1, 500);
    level.enabled = false;
    let channel = Arc::new(FakeChannel::new());
    let queue = PersistentQueue::new(10);
    let front = front(Arc::clone(&storage), sample_content(true, vec![level]), Arc::clone(&queue), Arc::clone(&channel));

    front.on_message(msg("u1", "hello")).await.expect("on_message failed");

    assert!(channel.last_text().to_lowercase().contains("unavailable"));
    assert_eq!(queue.len().await, 0);
}

#[tokio::test]
async fn all_levels_passed_sends_congratulations() {
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed"));
    storage.mark_level_passed("u1", 1, 1, Utc::now()).await.expect("mark_level_passed failed");
    let channel = Arc::new(FakeChannel::new());
    let queue = PersistentQueue::new(10);
    let front = front(Arc::clone(&storage), sample_content(true, vec![sample_level(1, 500)]), Arc::clone(&queue), Arc::clone(&channel));

    front.on_message(msg("u1", "hello")).await.expect("on_message failed");

    assert!(channel.last_text().to_lowercase().contains("congratulations"));
}

#[tokio::test]
async fn empty_submission_is_rejected_with_validation_message() {
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed"));
    let channel = Arc::new(FakeChannel::new());
    let queue = PersistentQueue::new(10);
    let front = front(Arc::clone(&storage), sample_content(true, vec![sample_level(1, 500)]), Arc::clone(&queue), Arc::clone(&channel));

    front.on_message(msg("u1", "   ")).await.expect("on_message failed");

    assert!(channel.last_text().to_lowercase().contains("empty"));
    assert_eq!(queue.len().await, 0);
}

#[tokio::test]
async fn double_submit_while_inflight_is_rejected() {
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed"));
    let channel = Arc::new(FakeChannel::new());
    let queue = PersistentQueue::new(10);
    let front = front(Arc::clone(&storage), sample_content(true, vec![sample_level(1, 500)]), Arc::clone(&queue), Arc::clone(&channel));

    front.on_message(msg("u1", "first attempt")).await.expect("on_message failed");
    assert_eq!(queue.len().await, 1);

    front.on_message(msg("u1", "second attempt")).await.expect("on_message failed");

    assert_eq!(queue.len().await, 1, "the second submission must not enqueue");
    assert!(channel.last_text().to_lowercase().contains("still processing"));
}

#[tokio::test]
async fn cooldown_not_yet_expired_is_rejected() {
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed"));
    let now = Utc::now();
    let mut session = Session::new_ready("u1", 1, now);
    session.state = SessionState::Cooldown;
    session.cooldown_until = Some(now + chrono::Duration::seconds(30));
    storage.upsert_session(&session).await.expect("upsert_session failed");
    let channel = Arc::new(FakeChannel::new());
    let queue = PersistentQueue::new(10);
    let front = front(Arc::clone(&storage), sample_content(true, vec![sample_level(1, 500)]), Arc::clone(&queue), Arc::clone(&channel));

    front.on_message(msg("u1", "retry")).await.expect("on_message failed");

    assert!(channel.last_text().to_lowercase().contains("wait"));
    assert_eq!(queue.len().await, 0);
}

#[tokio::test]
async fn expired_cooldown_allows_admission() {
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed"));
    let now = Utc::now();
    let mut session = Session::new_ready("u1", 1, now);
    session.state = SessionState::Cooldown;
    session.cooldown_until = Some(now - chrono::Duration::seconds(1));
    storage.upsert_session(&session).await.expect("upsert_session failed");
    let channel = Arc::new(FakeChannel::new());
    let queue = PersistentQueue::new(10);
    let front = front(Arc::clone(&storage), sample_content(true, vec![sample_level(1, 500)]), Arc::clone(&queue), Arc::clone(&channel));

    front.on_message(msg("u1", "retry")).await.expect("on_message failed");

    assert_eq!(queue.len().await, 1);
    let session = storage.get_session("u1", 1).await.expect("get_session query failed").expect("session should exist");
    assert_eq!(session.state, SessionState::Inflight);
}

#[tokio::test]
async fn passed_level_rejects_further_submissions() {
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed"));
    let now = Utc::now();
    let mut session = Session::new_ready("u1", 1, now);
    session.state = SessionState::Passed;
    storage.upsert_session(&session).await.expect("upsert_session failed");
    let channel = Arc::new(FakeChannel::new());
    let queue = PersistentQueue::new(10);
    let front = front(
        Arc::clone(&storage),
        sample_content(true, vec![sample_level(1, 500), sample_level(2, 500)]),
        Arc::clone(&queue),
        Arc::clone(&channel),
    );

    // level 1 is not recorded as passed in `level_progress`, so current_level
    // still resolves to it — this exercises the session-state guard directly,
    // independent of level progression.
    front.on_message(msg("u1", "retry")).await.expect("on_message failed");

    assert!(channel.last_text().to_lowercase().contains("already passed"));
}

#[tokio::test]
async fn successful_admission_flips_session_and_enqueues() {
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed"));
    let channel = Arc::new(FakeChannel::new());
    let queue = PersistentQueue::new(10);
    let front = front(Arc::clone(&storage), sample_content(true, vec![sample_level(1, 500)]), Arc::clone(&queue), Arc::clone(&channel));

    front.on_message(msg("u1", "print the handshake")).await.expect("on_message failed");

    assert_eq!(queue.len().await, 1);
    let session = storage.get_session("u1", 1).await.expect("get_session query failed").expect("session should exist");
    assert_eq!(session.state, SessionState::Inflight);
    assert!(channel.last_text().to_lowercase().contains("queued"));
}
