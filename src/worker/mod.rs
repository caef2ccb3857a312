//! A bounded pool of workers draining the [`PersistentQueue`] (spec §4.F).
//!
//! Follows the teacher's outbound-task `tokio::spawn` + `JoinHandle`
//! convention (`telegram::mod.rs`'s send-loop shape), generalized from one
//! background task to N concurrent dequeue-process loops with a shared
//! drain-on-shutdown contract.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::engine::GameEngine;
use crate::queue::PersistentQueue;

/// A running pool of worker tasks.
pub struct WorkerPoolHandle {
    queue: Arc<PersistentQueue>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPoolHandle {
    /// Spawn `concurrency` workers, each looping dequeue → `engine.process`.
    pub fn spawn(concurrency: usize, queue: Arc<PersistentQueue>, engine: Arc<GameEngine>) -> Self {
        let handles = (0..concurrency)
            .map(|worker_id| {
                let queue = Arc::clone(&queue);
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    while let Some(task) = queue.dequeue().await {
                        let task_id = task.task_id;
                        let user_id = task.user_id.clone();
                        let level_id = task.level_id;
                        if let Err(e) = engine.process(task).await {
                            tracing::error!(worker_id, %task_id, %user_id, level_id, error = %e, "task processing failed, recovering session");
                            if let Err(e) = engine.recover_fatal(task_id, &user_id, level_id).await {
                                tracing::error!(worker_id, %task_id, error = %e, "failed to recover session after fatal error");
                            }
                        }
                    }
                    tracing::info!(worker_id, "worker exiting, queue drained after shutdown");
                })
            })
            .collect();

        Self { queue, handles }
    }

    /// Signal shutdown and wait up to `drain_deadline` for all workers to
    /// finish their current and queued in-memory work. Undrained
    /// `pending_tasks` rows survive for the next run (spec §4.F).
    pub async fn shutdown(self, drain_deadline: Duration) {
        self.queue.signal_shutdown();

        let joined = tokio::time::timeout(drain_deadline, futures_join_all(self.handles)).await;
        if joined.is_err() {
            tracing::warn!("worker drain deadline elapsed; remaining tasks left for next run");
        }
    }
}

async fn futures_join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}
