//! Redis-backed cache partitioned across independent shards.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

use super::{shard_index, CacheClient};
use crate::config::{CacheConfig, ShardAddr};
use crate::error::CacheError;

/// Cache client holding one managed connection per shard.
///
/// `ConnectionManager` is cheap to clone and reconnects on its own, so every
/// call works on a clone of the shard's manager.
#[derive(Clone)]
pub struct ShardedRedisCache {
    shards: Vec<ConnectionManager>,
    op_timeout: Duration,
}

impl ShardedRedisCache {
    /// Connects to every shard in order.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Connection` if any shard is unreachable.
    pub async fn connect(config: &CacheConfig) -> Result<Self, CacheError> {
        let mut shards = Vec::with_capacity(config.shards.len());
        for addr in &config.shards {
            shards.push(connect_shard(addr).await?);
        }
        if shards.is_empty() {
            return Err(CacheError::Connection("no cache shards configured".to_string()));
        }

        info!(shards = shards.len(), "Connected to cache shards");

        Ok(Self {
            shards,
            op_timeout: config.op_timeout,
        })
    }

    fn shard_for(&self, key: &str) -> ConnectionManager {
        self.shards[shard_index(key, self.shards.len())].clone()
    }

    async fn bounded<T, F>(&self, key: &str, op: F) -> Result<T, CacheError>
    where
        F: Future<Output = redis::RedisResult<T>> + Send,
    {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(result) => result.map_err(|e| CacheError::from_redis(key, e)),
            Err(_) => Err(CacheError::Timeout {
                key: key.to_string(),
                timeout: self.op_timeout,
            }),
        }
    }
}

/// Opens a managed connection to a single shard.
pub(crate) async fn connect_shard(addr: &ShardAddr) -> Result<ConnectionManager, CacheError> {
    let client = redis::Client::open(addr.redis_url())
        .map_err(|e| CacheError::Connection(format!("{addr}: {e}")))?;
    ConnectionManager::new(client)
        .await
        .map_err(|e| CacheError::Connection(format!("{addr}: {e}")))
}

#[async_trait]
impl CacheClient for ShardedRedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.shard_for(key);
        self.bounded(key, async move { conn.get::<_, Option<String>>(key).await })
            .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut conn = self.shard_for(key);
        self.bounded(key, async move { conn.set::<_, _, ()>(key, value).await })
            .await
    }
}
