//! Partitioned key-value cache access.
//!
//! Callers see plain `get`/`set`; the shard a key lives on is chosen by a
//! deterministic hash so every worker process agrees on the placement.
//!
//! No method takes a lock. Writes to keys under concurrent mutation must be
//! issued while holding that key's lock from [`crate::lock::LockCoordinator`].

pub mod memory;
pub mod sharded;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::CacheError;

pub use memory::InMemoryCache;
pub use sharded::ShardedRedisCache;

/// Read/write access to the shared cache.
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Returns the stored value, or `None` if the key is absent.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Stores `value` under `key` without expiry.
    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError>;
}

/// Index of the shard owning `key` among `shards` shards.
///
/// Uses the first eight bytes of the key's SHA-256 digest, so the mapping is
/// identical across processes, platforms and builds.
pub fn shard_index(key: &str, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % shards as u64) as usize
}
