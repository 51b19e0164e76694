//! Cluster-wide mutual exclusion for the maintenance jobs.
//!
//! Locks are only ever tried, never waited for: a node that loses the race
//! skips the tick.

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{debug, warn};

use crate::StreamResult;

pub use memory::MemoryLockProvider;

#[cfg(feature = "redis")]
pub use self::redis::RedisLockProvider;

/// Proof of a held lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub key: String,
    /// Token identifying this holder; release only succeeds with it
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl LockHandle {
    pub fn new(key: impl Into<String>, holder: impl Into<String>, lease: Duration) -> Self {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            key: key.into(),
            holder: holder.into(),
            expires_at,
        }
    }
}

#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Take `key` for `lease` if nobody holds it; `None` when it is taken
    async fn try_acquire(&self, key: &str, holder: &str, lease: Duration) -> StreamResult<Option<LockHandle>>;

    /// Release a lock held through `handle`
    ///
    /// Returns `false` when the lock was no longer ours (lease expired and
    /// maybe taken by someone else).
    async fn release(&self, handle: &LockHandle) -> StreamResult<bool>;
}

pub type SharedLockProvider = Arc<dyn LockProvider>;

/// Run `work` while holding `key`, or return `Ok(None)` without running it
///
/// The lock is released whether `work` succeeds, fails or panics.
pub async fn run_exclusive<F, Fut, T>(
    locks: &dyn LockProvider,
    key: &str,
    holder: &str,
    lease: Duration,
    work: F,
) -> StreamResult<Option<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = StreamResult<T>>,
{
    let Some(handle) = locks.try_acquire(key, holder, lease).await? else {
        debug!(lock = %key, "Lock held elsewhere, skipping");
        return Ok(None);
    };

    let outcome = AssertUnwindSafe(work()).catch_unwind().await;

    match locks.release(&handle).await {
        Ok(true) => debug!(lock = %key, "Released lock"),
        Ok(false) => warn!(lock = %key, "Lock lease expired before release"),
        Err(err) => warn!(lock = %key, "Failed to release lock: {}", err),
    }

    match outcome {
        Ok(result) => result.map(Some),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamError;

    #[tokio::test]
    async fn test_run_exclusive_skips_when_held() {
        let locks = MemoryLockProvider::new();
        let held = locks
            .try_acquire("jobs:lock", "node-a", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let ran = run_exclusive(&locks, "jobs:lock", "node-b", Duration::from_secs(30), || async {
            Ok::<_, StreamError>(1)
        })
        .await
        .unwrap();
        assert_eq!(ran, None);

        assert!(locks.release(&held).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_exclusive_releases_after_failure() {
        let locks = MemoryLockProvider::new();

        let result = run_exclusive(&locks, "jobs:lock", "node-a", Duration::from_secs(30), || async {
            Err::<(), _>(StreamError::transport("broker down"))
        })
        .await;
        assert!(result.is_err());
        assert!(!locks.is_locked("jobs:lock"));
    }

    #[tokio::test]
    async fn test_run_exclusive_releases_after_panic() {
        let locks = Arc::new(MemoryLockProvider::new());

        let inner = locks.clone();
        let joined = tokio::spawn(async move {
            run_exclusive(inner.as_ref(), "jobs:lock", "node-a", Duration::from_secs(30), || async {
                if true {
                    panic!("handler blew up");
                }
                Ok::<(), StreamError>(())
            })
            .await
        })
        .await;

        assert!(joined.is_err());
        assert!(!locks.is_locked("jobs:lock"));
    }
}
