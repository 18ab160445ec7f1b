//! In-memory cache used by tests and local simulations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::CacheClient;
use crate::error::CacheError;

#[derive(Debug, Default)]
struct Inner {
    entries: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

/// Shared map behind the `CacheClient` contract. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    inner: Arc<Inner>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Makes every subsequent `set` fail with a store error until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Direct read that bypasses the client contract.
    pub fn snapshot(&self, key: &str) -> Option<String> {
        self.entries().get(key).cloned()
    }
}

#[async_trait]
impl CacheClient for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.entries().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::Store {
                key: key.to_string(),
                reason: "writes disabled".to_string(),
            });
        }
        self.entries().insert(key.to_string(), value.to_string());
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
