//! Connector over the in-memory backends.

use std::sync::Arc;

use async_trait::async_trait;

use super::consumer::{Connector, WorkerSession};
use crate::cache::InMemoryCache;
use crate::config::ConsumerConfig;
use crate::error::ConsumerError;
use crate::lock::{InMemoryLockShard, LockCoordinator, LockShard};
use crate::queue::InMemoryBroker;

/// Opens sessions against a shared `InMemoryBroker`, `InMemoryCache` and set
/// of `InMemoryLockShard`s. Clones share all three, so several workers built
/// from one connector compete exactly like separate processes would.
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
    cache: InMemoryCache,
    lock_shards: Vec<Arc<InMemoryLockShard>>,
}

impl InMemoryConnector {
    /// Creates a connector with `lock_shards` fresh lock shards.
    pub fn new(broker: InMemoryBroker, cache: InMemoryCache, lock_shards: usize) -> Self {
        let shards = (0..lock_shards)
            .map(|i| Arc::new(InMemoryLockShard::new(format!("memory-{i}"))))
            .collect();
        Self::with_lock_shards(broker, cache, shards)
    }

    /// Creates a connector over caller-provided lock shards.
    pub fn with_lock_shards(
        broker: InMemoryBroker,
        cache: InMemoryCache,
        lock_shards: Vec<Arc<InMemoryLockShard>>,
    ) -> Self {
        Self {
            broker,
            cache,
            lock_shards,
        }
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    pub fn cache(&self) -> &InMemoryCache {
        &self.cache
    }

    pub fn lock_shards(&self) -> &[Arc<InMemoryLockShard>] {
        &self.lock_shards
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(&self, config: &ConsumerConfig) -> Result<WorkerSession, ConsumerError> {
        let queue = self.broker.connect()?;
        let shards: Vec<Arc<dyn LockShard>> = self
            .lock_shards
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn LockShard>)
            .collect();
        let locks = LockCoordinator::from_config(shards, &config.lock)?;

        Ok(WorkerSession {
            queue: Box::new(queue),
            cache: Arc::new(self.cache.clone()),
            locks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, QueueError};

    #[tokio::test]
    async fn test_connect_fails_while_broker_down() {
        let connector = InMemoryConnector::new(InMemoryBroker::new(), InMemoryCache::new(), 3);
        connector.broker().set_available(false);

        let err = connector
            .connect(&ConsumerConfig::default())
            .await
            .err()
            .expect("broker down");
        assert!(matches!(err, ConsumerError::Queue(QueueError::Connection(_))));
    }

    #[tokio::test]
    async fn test_even_lock_shards_rejected() {
        let connector = InMemoryConnector::new(InMemoryBroker::new(), InMemoryCache::new(), 2);
        let err = connector
            .connect(&ConsumerConfig::default())
            .await
            .err()
            .expect("even shard count");
        assert!(matches!(err, ConsumerError::Config(ConfigError::EvenShardCount(2))));
    }
}
