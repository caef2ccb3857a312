//! The atomic reward-claim protocol (spec §4.D), layered over
//! [`Storage::claim_reward`] with a bounded retry for transient
//! `StorageError::Busy` contention — the conditional-update itself (the
//! no-overclaim backbone) lives in the storage layer so it stays inside
//! one transaction; this module only re-issues the whole call when the
//! writer was momentarily busy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::storage::{ClaimOutcome, Storage, StorageError};
use crate::types::{RewardClaim, RewardItem};

/// Bound on retries when the storage layer reports contention.
const MAX_CLAIM_RETRIES: u32 = 3;

/// Backoff between retries.
const RETRY_BACKOFF: Duration = Duration::from_millis(20);

/// Errors from the claim protocol.
#[derive(Debug, Error)]
pub enum ClaimError {
    /// Storage reported an error other than transient busy, or busy
    /// persisted past the retry budget.
    #[error("claim failed: {0}")]
    Storage(#[from] StorageError),
}

/// The outcome of a claim attempt, mirroring spec §4.D's `ClaimResult`.
#[derive(Debug, Clone)]
pub enum ClaimResult {
    /// A fresh item was claimed.
    Claimed {
        /// The recorded claim.
        claim: RewardClaim,
        /// The item dispensed.
        item: RewardItem,
    },
    /// This (user, level) already had a claim.
    AlreadyClaimed(RewardClaim),
    /// No item in the pool had remaining capacity.
    PoolExhausted,
}

/// Attempt to claim a reward for `(user_id, level_id)` from `pool_id`,
/// retrying on transient storage contention.
///
/// # Errors
///
/// Returns [`ClaimError`] if storage fails for a non-retryable reason, or
/// stays busy past [`MAX_CLAIM_RETRIES`].
pub async fn claim_reward(
    storage: &dyn Storage,
    pool_id: &str,
    user_id: &str,
    level_id: i64,
    turns_used: i64,
    now: DateTime<Utc>,
) -> Result<ClaimResult, ClaimError> {
    let mut attempt = 0;
    loop {
        match storage
            .claim_reward(pool_id, user_id, level_id, turns_used, now)
            .await
        {
            Ok(ClaimOutcome::Claimed { claim, item }) => return Ok(ClaimResult::Claimed { claim, item }),
            Ok(ClaimOutcome::AlreadyClaimed(claim)) => return Ok(ClaimResult::AlreadyClaimed(claim)),
            Ok(ClaimOutcome::PoolExhausted) => return Ok(ClaimResult::PoolExhausted),
            Err(StorageError::Busy) if attempt < MAX_CLAIM_RETRIES => {
                attempt += 1;
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            Err(e) => return Err(ClaimError::Storage(e)),
        }
    }
}
