//! In-memory lock shard for tests and local simulations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::LockShard;
use crate::error::LockError;

/// Lock shard backed by a process-local map with per-entry deadlines.
///
/// Can be made unreachable to simulate a network partition, and can add a
/// fixed latency to every set to simulate a slow round.
#[derive(Debug)]
pub struct InMemoryLockShard {
    name: String,
    entries: Mutex<HashMap<String, (String, Instant)>>,
    reachable: AtomicBool,
    latency: Duration,
}

impl InMemoryLockShard {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            latency: Duration::ZERO,
        }
    }

    /// Delays every `set_if_absent` by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Cuts the shard off (`false`) or reconnects it (`true`).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Token currently holding `resource`, ignoring expired entries.
    pub fn holder(&self, resource: &str) -> Option<String> {
        let now = Instant::now();
        self.entries()
            .get(resource)
            .filter(|(_, deadline)| *deadline > now)
            .map(|(token, _)| token.clone())
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, (String, Instant)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_reachable(&self) -> Result<(), LockError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LockError::Shard {
                shard: self.name.clone(),
                reason: "unreachable".to_string(),
            })
        }
    }
}

#[async_trait]
impl LockShard for InMemoryLockShard {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_if_absent(
        &self,
        resource: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.check_reachable()?;

        let now = Instant::now();
        let mut entries = self.entries();
        if let Some((_, deadline)) = entries.get(resource) {
            if *deadline > now {
                return Ok(false);
            }
        }
        entries.insert(resource.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn release_if_owner(&self, resource: &str, token: &str) -> Result<bool, LockError> {
        self.check_reachable()?;

        let mut entries = self.entries();
        let owned = entries.get(resource).is_some_and(|(held, _)| held == token);
        if owned {
            entries.remove(resource);
        }
        Ok(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_if_absent() {
        let shard = InMemoryLockShard::new("s");
        assert!(shard
            .set_if_absent("r", "a", Duration::from_secs(1))
            .await
            .expect("reachable"));
        assert!(!shard
            .set_if_absent("r", "b", Duration::from_secs(1))
            .await
            .expect("reachable"));
        assert_eq!(shard.holder("r").as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_entry_expires() {
        let shard = InMemoryLockShard::new("s");
        shard
            .set_if_absent("r", "a", Duration::from_millis(10))
            .await
            .expect("reachable");
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(shard.holder("r"), None);
        assert!(shard
            .set_if_absent("r", "b", Duration::from_secs(1))
            .await
            .expect("reachable"));
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let shard = InMemoryLockShard::new("s");
        shard
            .set_if_absent("r", "a", Duration::from_secs(1))
            .await
            .expect("reachable");

        assert!(!shard.release_if_owner("r", "b").await.expect("reachable"));
        assert_eq!(shard.holder("r").as_deref(), Some("a"));
        assert!(shard.release_if_owner("r", "a").await.expect("reachable"));
        assert_eq!(shard.holder("r"), None);
    }

    #[tokio::test]
    async fn test_unreachable_shard_errors() {
        let shard = InMemoryLockShard::new("s");
        shard.set_reachable(false);
        let err = shard
            .set_if_absent("r", "a", Duration::from_secs(1))
            .await
            .expect_err("partitioned");
        assert!(matches!(err, LockError::Shard { .. }));
    }
}
