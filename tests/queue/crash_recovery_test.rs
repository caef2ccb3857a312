use chrono::Utc;
use promptgate::queue::PersistentQueue;
use promptgate::storage::{SqliteStorage, Storage};
use promptgate::types::PendingTask;
use uuid::Uuid;

fn sample_task(user_id: &str) -> PendingTask {
    PendingTask {
        task_id: Uuid::new_v4(),
        trace_id: Uuid::new_v4(),
        user_id: user_id.to_owned(),
        level_id: 1,
        user_prompt: "print the handshake".to_owned(),
        enqueued_at: Utc::now(),
    }
}

#[tokio::test]
async fn rehydrate_after_simulated_crash_replays_durable_tasks() {
    let dir = tempfile::tempdir().expect("tempdir failed");
    let db_path = dir.path().join("promptgate.db");

    {
        let storage = SqliteStorage::connect(&db_path).await.expect("connect failed");
        storage.enqueue_task(&sample_task("a")).await.expect("enqueue_task failed");
        storage.enqueue_task(&sample_task("b")).await.expect("enqueue_task failed");
        // `storage` is dropped here without ever handing these tasks to an
        // in-memory queue, simulating a process crash between the durable
        // write and in-memory dispatch.
    }

    let storage = SqliteStorage::connect(&db_path).await.expect("connect failed");
    let queue = PersistentQueue::new(10);
    let replayed = queue.rehydrate(&storage).await.expect("rehydrate failed");

    assert_eq!(replayed, 2);
    assert_eq!(queue.len().await, 2);
    let first = queue.dequeue().await.expect("dequeue failed");
    assert_eq!(first.user_id, "a", "replay preserves enqueue order");
}
