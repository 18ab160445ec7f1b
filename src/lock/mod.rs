//! Quorum-based distributed locking over independent shards.
//!
//! This module provides mutual exclusion across worker processes:
//!
//! - **LockShard**: one independent store offering set-if-absent with expiry
//!   and compare-and-delete
//! - **LockCoordinator**: acquires a lock only when a strict majority of
//!   shards accept the same random token within the lock's validity
//! - **RetryPolicy**: bounded, jittered exponential backoff between rounds
//!
//! # Algorithm
//!
//! ```text
//!   token = random
//!   t0 = now
//!   votes = [shard.set_if_absent(resource, token, ttl) for shard in shards]
//!   validity = ttl - (now - t0) - drift
//!   acquired = count(votes) >= N/2 + 1 && validity > 0
//!   if !acquired: release token everywhere (best effort)
//! ```
//!
//! Drift is `ttl * drift_factor + 2ms`. A holder that crashes never blocks
//! others for longer than the TTL: every shard expires the token on its own.
//! Losing a minority of shards does not affect availability; losing the
//! majority blocks new acquisitions.

pub mod memory;
pub mod redis_shard;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use rand::RngExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{drift_margin, LockConfig};
use crate::error::{ConfigError, LockError};
use crate::metrics::MetricsCollector;

pub use memory::InMemoryLockShard;
pub use redis_shard::RedisLockShard;

/// One independent lock store.
#[async_trait]
pub trait LockShard: Send + Sync {
    /// Identifier used in logs.
    fn name(&self) -> &str;

    /// Stores `token` under `resource` with expiry `ttl` unless the resource
    /// is already held. Returns whether the token was stored.
    async fn set_if_absent(
        &self,
        resource: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError>;

    /// Deletes `resource` only if it still holds `token`. Returns whether a
    /// deletion happened.
    async fn release_if_owner(&self, resource: &str, token: &str) -> Result<bool, LockError>;
}

/// A held lock.
///
/// The lock is only meaningful while `is_valid()`; after that another holder
/// may legitimately own the resource.
#[derive(Debug)]
pub struct Lock {
    resource: String,
    token: String,
    validity: Duration,
    acquired_at: Instant,
}

impl Lock {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Validity computed at acquisition time, drift already subtracted.
    pub fn validity(&self) -> Duration {
        self.validity
    }

    /// Time left before the lock must be considered lost.
    pub fn remaining(&self) -> Duration {
        self.validity.saturating_sub(self.acquired_at.elapsed())
    }

    pub fn is_valid(&self) -> bool {
        !self.remaining().is_zero()
    }
}

/// Bounded retry schedule for lock acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total quorum rounds, including the first.
    pub max_attempts: u32,
    /// Backoff ceiling after the first failed round.
    pub base_delay: Duration,
    /// Upper bound for any single backoff.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl From<&LockConfig> for RetryPolicy {
    fn from(config: &LockConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the backoff after failed round `attempt` (0-based).
    ///
    /// Doubles per round, capped by `max_delay` and by half the TTL so a
    /// waiting worker always retries well inside a competitor's lease.
    pub fn backoff_ceiling(&self, attempt: u32, ttl: Duration) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
            .min(ttl / 2)
    }

    /// Randomized delay in `[ceiling / 2, ceiling]`.
    pub fn delay(&self, attempt: u32, ttl: Duration) -> Duration {
        let ceiling = self.backoff_ceiling(attempt, ttl).as_micros() as u64;
        let floor = ceiling / 2;
        let micros = rand::rng().random_range(floor..=ceiling);
        Duration::from_micros(micros)
    }

    /// Longest time `acquire` can spend sleeping between rounds.
    pub fn max_backoff(&self, ttl: Duration) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| self.backoff_ceiling(attempt, ttl))
            .sum()
    }
}

/// Acquires and releases quorum locks across `N` shards.
pub struct LockCoordinator {
    shards: Vec<Arc<dyn LockShard>>,
    retry: RetryPolicy,
    drift_factor: f64,
    shard_timeout: Duration,
    metrics: MetricsCollector,
}

impl LockCoordinator {
    /// Creates a coordinator over an odd, non-empty set of shards.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `shards` is empty or has an even length.
    pub fn new(shards: Vec<Arc<dyn LockShard>>) -> Result<Self, ConfigError> {
        if shards.is_empty() {
            return Err(ConfigError::NoShards("lock"));
        }
        if shards.len() % 2 == 0 {
            return Err(ConfigError::EvenShardCount(shards.len()));
        }
        let defaults = LockConfig::default();
        Ok(Self {
            shards,
            retry: RetryPolicy::default(),
            drift_factor: defaults.drift_factor,
            shard_timeout: defaults.shard_timeout,
            metrics: MetricsCollector::new(),
        })
    }

    /// Creates a coordinator tuned by `config`.
    pub fn from_config(
        shards: Vec<Arc<dyn LockShard>>,
        config: &LockConfig,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(shards)?
            .with_retry(RetryPolicy::from(config))
            .with_drift_factor(config.drift_factor)
            .with_shard_timeout(config.shard_timeout))
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the clock drift factor.
    pub fn with_drift_factor(mut self, factor: f64) -> Self {
        self.drift_factor = factor;
        self
    }

    /// Sets the per-shard call timeout.
    pub fn with_shard_timeout(mut self, timeout: Duration) -> Self {
        self.shard_timeout = timeout;
        self
    }

    /// Strict majority: `N / 2 + 1`.
    pub fn quorum(&self) -> usize {
        self.shards.len() / 2 + 1
    }

    /// Margin subtracted from every validity computed for `ttl`.
    pub fn drift_margin(&self, ttl: Duration) -> Duration {
        drift_margin(ttl, self.drift_factor)
    }

    /// Runs a single quorum round.
    ///
    /// Returns `None` when the majority was not reached or the validity left
    /// after the round is not positive. Tokens placed on a minority of shards
    /// are released before returning.
    pub async fn try_acquire(&self, resource: &str, ttl: Duration) -> Option<Lock> {
        let token = Uuid::new_v4().simple().to_string();
        let started = Instant::now();

        let votes = join_all(
            self.shards
                .iter()
                .map(|shard| self.offer(shard.as_ref(), resource, &token, ttl)),
        )
        .await;
        let accepted = votes.into_iter().filter(|accepted| *accepted).count();

        let elapsed = started.elapsed();
        let validity = ttl
            .checked_sub(elapsed)
            .and_then(|left| left.checked_sub(self.drift_margin(ttl)))
            .unwrap_or(Duration::ZERO);

        if accepted >= self.quorum() && !validity.is_zero() {
            debug!(
                resource = resource,
                accepted = accepted,
                validity_ms = validity.as_millis() as u64,
                "Lock acquired"
            );
            return Some(Lock {
                resource: resource.to_string(),
                token,
                validity,
                acquired_at: started,
            });
        }

        debug!(
            resource = resource,
            accepted = accepted,
            quorum = self.quorum(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Quorum not reached"
        );
        // Shards that timed out may still have stored the token, so clean up
        // everywhere, not only where the vote came back positive.
        self.release_token(resource, &token).await;
        None
    }

    /// Acquires `resource`, retrying with backoff up to the policy limit.
    ///
    /// # Errors
    ///
    /// Returns `LockError::Timeout` once every round has failed.
    pub async fn acquire(&self, resource: &str, ttl: Duration) -> Result<Lock, LockError> {
        let attempts = self.retry.max_attempts.max(1);

        for attempt in 0..attempts {
            if let Some(lock) = self.try_acquire(resource, ttl).await {
                self.metrics.record_lock("acquired", attempt + 1);
                return Ok(lock);
            }

            if attempt + 1 < attempts {
                let delay = self.retry.delay(attempt, ttl);
                debug!(
                    resource = resource,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Lock busy, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }

        self.metrics.record_lock("timeout", attempts);
        warn!(resource = resource, attempts = attempts, "Lock retry budget exhausted");
        Err(LockError::Timeout {
            resource: resource.to_string(),
            attempts,
        })
    }

    /// Releases `lock` on every shard that still holds its token.
    ///
    /// Returns the number of shards the token was removed from. Shard
    /// failures are logged; the TTL reclaims whatever could not be deleted.
    pub async fn release(&self, lock: &Lock) -> usize {
        self.release_token(&lock.resource, &lock.token).await
    }

    async fn offer(&self, shard: &dyn LockShard, resource: &str, token: &str, ttl: Duration) -> bool {
        match tokio::time::timeout(self.shard_timeout, shard.set_if_absent(resource, token, ttl))
            .await
        {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                debug!(shard = shard.name(), error = %e, "Lock shard refused");
                false
            }
            Err(_) => {
                debug!(shard = shard.name(), "Lock shard timed out");
                false
            }
        }
    }

    async fn release_token(&self, resource: &str, token: &str) -> usize {
        let results = join_all(self.shards.iter().map(|shard| async move {
            let outcome = tokio::time::timeout(
                self.shard_timeout,
                shard.release_if_owner(resource, token),
            )
            .await;
            (shard.name(), outcome)
        }))
        .await;

        let mut released = 0;
        for (shard, outcome) in results {
            match outcome {
                Ok(Ok(true)) => released += 1,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => warn!(shard = shard, resource = resource, error = %e, "Lock release failed"),
                Err(_) => warn!(shard = shard, resource = resource, "Lock release timed out"),
            }
        }
        released
    }
}
