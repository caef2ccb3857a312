//! Per-user mutex map with lazy creation and reference-counted cleanup
//! (design note §9), serializing the "check state → flip INFLIGHT →
//! enqueue" critical section without a single global lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// The per-user lock map's backing `std::sync::Mutex` was poisoned by a
/// panicking holder.
#[derive(Debug, Error)]
#[error("per-user lock map poisoned: {0}")]
pub struct LockPoisoned(String);

/// The map of per-user mutexes.
pub struct PerUserLocks {
    map: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl PerUserLocks {
    /// An empty map.
    pub fn new() -> Self {
        Self {
            map: StdMutex::new(HashMap::new()),
        }
    }

    /// Acquire the mutex for `user_id`, creating it if this is the first
    /// caller. The returned guard removes the map entry on drop if no
    /// other caller is waiting.
    ///
    /// # Errors
    ///
    /// Returns [`LockPoisoned`] if a prior holder panicked while holding
    /// the map lock.
    pub async fn acquire(&self, user_id: &str) -> Result<UserGuard<'_>, LockPoisoned> {
        let arc = {
            let mut map = self.map.lock().map_err(|e| LockPoisoned(e.to_string()))?;
            Arc::clone(
                map.entry(user_id.to_owned())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        let guard = Arc::clone(&arc).lock_owned().await;
        Ok(UserGuard {
            locks: self,
            user_id: user_id.to_owned(),
            arc,
            guard: Some(guard),
        })
    }
}

impl Default for PerUserLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds one user's lock; dropping it releases the lock and, if no other
/// holder remains, removes the map entry.
pub struct UserGuard<'a> {
    locks: &'a PerUserLocks,
    user_id: String,
    arc: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // `Drop` can't propagate a `Result`; recover the inner map rather
        // than panic so one poisoned holder doesn't wedge every later
        // caller's cleanup too.
        let mut map = self.locks.map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(entry) = map.get(&self.user_id) {
            // `map`'s own clone + our `self.arc` clone account for 2; if
            // nothing else holds a reference, this is the last user of it.
            if Arc::strong_count(entry) <= 2 {
                map.remove(&self.user_id);
            }
        }
    }
}
