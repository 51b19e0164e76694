use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{LockHandle, LockProvider};
use crate::StreamResult;

/// Leases longer than this are clamped
const MAX_LEASE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

#[derive(Debug)]
struct Lease {
    holder: String,
    expires: Instant,
}

/// Process-local lock provider; leases expire like their distributed counterparts
#[derive(Debug, Default)]
pub struct MemoryLockProvider {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an unexpired lease exists for `key`
    pub fn is_locked(&self, key: &str) -> bool {
        self.leases
            .lock()
            .get(key)
            .map(|lease| lease.expires > Instant::now())
            .unwrap_or(false)
    }
}

#[async_trait]
impl LockProvider for MemoryLockProvider {
    async fn try_acquire(&self, key: &str, holder: &str, lease: Duration) -> StreamResult<Option<LockHandle>> {
        let now = Instant::now();
        let mut leases = self.leases.lock();

        if leases.get(key).is_some_and(|current| current.expires > now) {
            return Ok(None);
        }

        leases.insert(
            key.to_string(),
            Lease {
                holder: holder.to_string(),
                expires: now.checked_add(lease).unwrap_or(now + MAX_LEASE),
            },
        );
        Ok(Some(LockHandle::new(key, holder, lease)))
    }

    async fn release(&self, handle: &LockHandle) -> StreamResult<bool> {
        let mut leases = self.leases.lock();
        let ours = leases
            .get(&handle.key)
            .is_some_and(|lease| lease.holder == handle.holder && lease.expires > Instant::now());
        if ours {
            leases.remove(&handle.key);
        }
        Ok(ours)
    }
}
