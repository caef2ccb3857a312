//! A bounded, crash-recoverable FIFO queue of [`PendingTask`]s.
//!
//! The durable record lives in `Storage::pending_tasks`; this type is the
//! in-memory front the worker pool actually dequeues from, rehydrated from
//! storage on startup so a restart replays whatever wasn't drained (spec
//! §4.B, §8 "crash recovery"). Mirrors the teacher's `kernel::journal`
//! pattern of "in-memory structure, `Notify` for wakeups, storage is the
//! source of truth on restart," generalized from a single recovery log to
//! an ordered work queue.

use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{watch, Mutex, Notify};

use crate::storage::{Storage, StorageError};
use crate::types::PendingTask;

/// Errors enqueuing a task.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue is already at `queue_max_length` capacity.
    #[error("queue is full (max {max})")]
    Full {
        /// The configured capacity.
        max: usize,
    },
    /// Persisting the task to storage failed.
    #[error("failed to persist task: {0}")]
    Storage(#[from] StorageError),
}

struct QueueInner {
    tasks: VecDeque<PendingTask>,
}

/// A persistent, bounded FIFO queue of pending grading tasks.
pub struct PersistentQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    max_length: usize,
    shutdown_tx: watch::Sender<bool>,
}

impl PersistentQueue {
    /// Build an empty queue with the given capacity. Call [`Self::rehydrate`]
    /// before workers start draining it.
    pub fn new(max_length: usize) -> Arc<Self> {
        let (shutdown_tx, _rx) = watch::channel(false);
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                tasks: VecDeque::new(),
            }),
            notify: Notify::new(),
            max_length,
            shutdown_tx,
        })
    }

    /// Load every row from `pending_tasks`, in FIFO order, into memory.
    /// Called once at startup so in-flight-at-crash tasks are replayed.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage layer cannot list pending tasks.
    pub async fn rehydrate(&self, storage: &dyn Storage) -> Result<usize, StorageError> {
        let tasks = storage.list_pending_tasks_ordered().await?;
        let count = tasks.len();
        let mut inner = self.inner.lock().await;
        inner.tasks = tasks.into();
        drop(inner);
        if count > 0 {
            self.notify.notify_waiters();
        }
        Ok(count)
    }

    /// Persist `task` and append it to the in-memory tail.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Full`] if the queue is at capacity, or
    /// [`QueueError::Storage`] if the durable write fails.
    pub async fn enqueue(&self, storage: &dyn Storage, task: PendingTask) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        if inner.tasks.len() >= self.max_length {
            return Err(QueueError::Full { max: self.max_length });
        }
        storage.enqueue_task(&task).await?;
        inner.tasks.push_back(task);
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Append an already-persisted task directly to the in-memory tail,
    /// without writing to storage. Used by Admission after
    /// `Storage::admit_task` has already committed the row transactionally
    /// alongside the session flip and audit log (spec §4.G step 6).
    pub async fn push_persisted(&self, task: PendingTask) {
        let mut inner = self.inner.lock().await;
        inner.tasks.push_back(task);
        drop(inner);
        self.notify.notify_one();
    }

    /// Wait for and remove the task at the head of the queue. Returns
    /// `None` once shutdown has been signalled and the queue is drained.
    pub async fn dequeue(&self) -> Option<PendingTask> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(task) = inner.tasks.pop_front() {
                    return Some(task);
                }
            }
            if *self.shutdown_tx.borrow() {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Current in-memory depth (used by the admin `stats` surface; may lag
    /// the durable row count by the in-flight window of a single task).
    pub async fn len(&self) -> usize {
        self.inner.lock().await.tasks.len()
    }

    /// Whether the queue currently holds no tasks.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Signal shutdown: no further `dequeue` calls will block once the
    /// in-memory queue drains. Does not clear persisted rows; a worker
    /// still owns deleting a task's row once it finishes processing it.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.notify.notify_waiters();
    }

    /// Drop every in-memory task without touching storage (admin `clear_queue`
    /// deletes the durable rows separately and hands the drained tasks back
    /// to the engine so each one's session can be released).
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.tasks.clear();
    }
}
