//! Lock shard on a standalone Redis node.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use super::LockShard;
use crate::cache::sharded::connect_shard;
use crate::config::ShardAddr;
use crate::error::{CacheError, LockError};

/// Deletes the key only when it still holds the caller's token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// `SET NX PX` acquisition and scripted compare-and-delete on one node.
#[derive(Clone)]
pub struct RedisLockShard {
    name: String,
    conn: ConnectionManager,
}

impl RedisLockShard {
    /// Connects to the node at `addr`.
    pub async fn connect(addr: &ShardAddr) -> Result<Self, CacheError> {
        Ok(Self {
            name: addr.to_string(),
            conn: connect_shard(addr).await?,
        })
    }

    fn shard_error(&self, err: redis::RedisError) -> LockError {
        LockError::Shard {
            shard: self.name.clone(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl LockShard for RedisLockShard {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_if_absent(
        &self,
        resource: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(resource)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.shard_error(e))?;
        Ok(reply.is_some())
    }

    async fn release_if_owner(&self, resource: &str, token: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(resource)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.shard_error(e))?;
        Ok(removed == 1)
    }
}
