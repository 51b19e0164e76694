use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};

use super::{LockHandle, LockProvider};
use crate::{StreamError, StreamResult};

/// Deletes the key only if it still holds our token
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Lock provider backed by `SET key token NX PX lease`
pub struct RedisLockProvider {
    conn: ConnectionManager,
    release: Script,
}

impl RedisLockProvider {
    pub async fn connect(url: &str) -> StreamResult<Self> {
        let client = Client::open(url)?;
        Ok(Self::new(ConnectionManager::new(client).await?))
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            release: Script::new(RELEASE_SCRIPT),
        }
    }
}

#[async_trait]
impl LockProvider for RedisLockProvider {
    async fn try_acquire(&self, key: &str, holder: &str, lease: Duration) -> StreamResult<Option<LockHandle>> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(lease.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| StreamError::LockFailed(e.to_string()))?;

        Ok(reply.map(|_| LockHandle::new(key, holder, lease)))
    }

    async fn release(&self, handle: &LockHandle) -> StreamResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(&handle.key)
            .arg(&handle.holder)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StreamError::LockFailed(e.to_string()))?;
        Ok(deleted == 1)
    }
}
