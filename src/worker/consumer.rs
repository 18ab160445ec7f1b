//! Consumer worker: one message per cycle, guarded by the quorum lock.
//!
//! # Cycle
//!
//! ```text
//!   Idle -> Receiving -> Processing -> LockAcquiring -> Mutating -> Acking -> Idle
//!              |             |               |              |
//!              v             v               v              v
//!            Idle         Failed          Failed         Failed -> Idle
//! ```
//!
//! The success path always commits the cache write, then releases the lock,
//! then acknowledges the message. A failure never escapes a cycle: it is
//! turned into a rejection (with or without requeue) and reported in the
//! returned [`CycleReport`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheClient, ShardedRedisCache};
use crate::config::ConsumerConfig;
use crate::error::{CacheError, ConsumerError, Disposition, LockError, QueueError};
use crate::lock::{Lock, LockCoordinator, LockShard, RedisLockShard};
use crate::metrics::MetricsCollector;
use crate::processor::{LogicalKey, MessageProcessor, WorkItem};
use crate::queue::{AmqpQueue, QueueClient, QueueMessage, Topology};

/// Live connections a worker needs for one or more cycles.
pub struct WorkerSession {
    pub queue: Box<dyn QueueClient>,
    pub cache: Arc<dyn CacheClient>,
    pub locks: LockCoordinator,
}

/// Opens worker sessions.
///
/// Called on startup and again after every connection loss. The returned
/// queue only needs to be connected; the worker declares topology and starts
/// consuming itself.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ConsumerConfig) -> Result<WorkerSession, ConsumerError>;
}

/// Connects to RabbitMQ and to the Redis cache and lock shards.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisAmqpConnector;

#[async_trait]
impl Connector for RedisAmqpConnector {
    async fn connect(&self, config: &ConsumerConfig) -> Result<WorkerSession, ConsumerError> {
        let prefetch = u16::try_from(config.max_messages_per_poll).unwrap_or(u16::MAX);
        let queue = AmqpQueue::connect(&config.broker, prefetch).await?;
        let cache = ShardedRedisCache::connect(&config.cache).await?;

        let mut shards: Vec<Arc<dyn LockShard>> = Vec::with_capacity(config.lock_shards().len());
        for addr in config.lock_shards() {
            shards.push(Arc::new(RedisLockShard::connect(addr).await?));
        }
        let locks = LockCoordinator::from_config(shards, &config.lock)?;

        Ok(WorkerSession {
            queue: Box::new(queue),
            cache: Arc::new(cache),
            locks,
        })
    }
}

/// States a cycle moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Receiving,
    Processing,
    LockAcquiring,
    Mutating,
    Acking,
    Failed,
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// No message arrived within the poll timeout.
    Idle,
    /// The change committed and the message was acknowledged. `written` is
    /// false when the cache already held this payload.
    Acked { key: String, written: bool },
    /// A poison message was rejected without requeue.
    Dropped { reason: String },
    /// A retryable failure put the message back on the queue.
    Requeued { key: String, reason: String },
    /// The session was lost or could not be opened.
    Disconnected { reason: String },
}

impl CycleOutcome {
    /// Metrics label.
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Idle => "idle",
            CycleOutcome::Acked { .. } => "acked",
            CycleOutcome::Dropped { .. } => "dropped",
            CycleOutcome::Requeued { .. } => "requeued",
            CycleOutcome::Disconnected { .. } => "disconnected",
        }
    }

    /// Whether a message was received and settled.
    pub fn settled_message(&self) -> bool {
        matches!(
            self,
            CycleOutcome::Acked { .. } | CycleOutcome::Dropped { .. } | CycleOutcome::Requeued { .. }
        )
    }
}

/// Result of a single cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    /// States visited, in order, starting and ending in `Idle`.
    pub trail: Vec<CycleState>,
}

impl CycleReport {
    /// Whether the cycle got as far as receiving a message.
    pub fn received(&self) -> bool {
        self.trail.contains(&CycleState::Processing)
    }
}

/// Cumulative tally threaded from one poll to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResults {
    pub cycles: u64,
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dropped: u64,
    pub idle: u64,
    pub disconnected: u64,
    /// Logical key of the most recently acknowledged message.
    pub last_key: Option<String>,
}

impl PollResults {
    pub fn record(&mut self, report: &CycleReport) {
        self.cycles += 1;
        if report.received() {
            self.received += 1;
        }
        match &report.outcome {
            CycleOutcome::Idle => self.idle += 1,
            CycleOutcome::Acked { key, .. } => {
                self.acked += 1;
                self.last_key = Some(key.clone());
            }
            CycleOutcome::Dropped { .. } => self.dropped += 1,
            CycleOutcome::Requeued { .. } => self.requeued += 1,
            CycleOutcome::Disconnected { .. } => self.disconnected += 1,
        }
    }
}

/// Exponential backoff between failed connection attempts.
#[derive(Debug)]
struct Reconnect {
    base: Duration,
    max: Duration,
    failures: u32,
    not_before: Option<Instant>,
}

impl Reconnect {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
            not_before: None,
        }
    }

    fn due(&self) -> bool {
        self.not_before.map_or(true, |at| Instant::now() >= at)
    }

    fn failed(&mut self) -> Duration {
        let factor = 1u32 << self.failures.min(16);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.failures = self.failures.saturating_add(1);
        self.not_before = Some(Instant::now() + delay);
        delay
    }

    fn succeeded(&mut self) {
        self.failures = 0;
        self.not_before = None;
    }
}

/// Ordered record of the states a cycle visits.
struct Trail(Vec<CycleState>);

impl Trail {
    fn enter(&mut self, state: CycleState) {
        self.0.push(state);
    }
}

/// Single-threaded consumer that runs one message per cycle.
pub struct ConsumerWorker {
    id: String,
    config: ConsumerConfig,
    connector: Arc<dyn Connector>,
    processor: Arc<dyn MessageProcessor>,
    session: Option<WorkerSession>,
    reconnect: Reconnect,
    metrics: MetricsCollector,
}

impl ConsumerWorker {
    pub fn new(
        config: ConsumerConfig,
        connector: Arc<dyn Connector>,
        processor: Arc<dyn MessageProcessor>,
    ) -> Self {
        let reconnect = Reconnect::new(config.reconnect_base, config.reconnect_max);
        Self {
            id: config.broker.consumer_tag.clone(),
            config,
            connector,
            processor,
            session: None,
            reconnect,
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets the identifier used in logs.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Opens a session now if none is open and the backoff allows it.
    pub async fn connect(&mut self) -> Result<(), ConsumerError> {
        if self.session.is_none() {
            let session = self.open_session().await?;
            self.session = Some(session);
        }
        Ok(())
    }

    /// Closes the current session, if any. Unsettled deliveries go back to
    /// the queue.
    pub async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.queue.close().await {
                debug!(worker_id = %self.id, error = %e, "Error closing broker session");
            }
        }
    }

    /// Runs one message through the cycle.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let started = Instant::now();
        let mut trail = Trail(vec![CycleState::Idle]);

        let outcome = match self.session.take() {
            Some(session) => self.process_with(session, &mut trail).await,
            None => match self.open_session().await {
                Ok(session) => self.process_with(session, &mut trail).await,
                Err(e) => {
                    trail.enter(CycleState::Failed);
                    CycleOutcome::Disconnected {
                        reason: e.to_string(),
                    }
                }
            },
        };

        trail.enter(CycleState::Idle);
        self.metrics.record_cycle(outcome.label(), started.elapsed());
        if outcome.settled_message() {
            self.metrics.record_message(outcome.label());
        }

        CycleReport {
            outcome,
            trail: trail.0,
        }
    }

    async fn open_session(&mut self) -> Result<WorkerSession, ConsumerError> {
        if !self.reconnect.due() {
            return Err(QueueError::Connection(
                "waiting for reconnect backoff".to_string(),
            )
            .into());
        }

        match self.try_open_session().await {
            Ok(session) => {
                self.reconnect.succeeded();
                self.metrics.record_reconnect(true);
                info!(
                    worker_id = %self.id,
                    queue = %self.config.broker.queue,
                    "Consumer session established"
                );
                Ok(session)
            }
            Err(e) => {
                let delay = self.reconnect.failed();
                self.metrics.record_reconnect(false);
                error!(
                    worker_id = %self.id,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Failed to establish consumer session"
                );
                Err(e)
            }
        }
    }

    async fn try_open_session(&self) -> Result<WorkerSession, ConsumerError> {
        let mut session = self.connector.connect(&self.config).await?;
        session
            .queue
            .declare_topology(&Topology::from(&self.config.broker))
            .await?;
        session.queue.consume().await?;
        Ok(session)
    }

    /// Runs the cycle on `session`, keeping it unless the connection was lost.
    async fn process_with(&mut self, mut session: WorkerSession, trail: &mut Trail) -> CycleOutcome {
        let outcome = self.process(&mut session, trail).await;
        if let CycleOutcome::Disconnected { reason } = &outcome {
            warn!(worker_id = %self.id, reason = %reason, "Dropping consumer session");
            if let Err(e) = session.queue.close().await {
                debug!(worker_id = %self.id, error = %e, "Error closing broker session");
            }
        } else {
            self.session = Some(session);
        }
        outcome
    }

    async fn process(&self, session: &mut WorkerSession, trail: &mut Trail) -> CycleOutcome {
        trail.enter(CycleState::Receiving);
        let message = match session.queue.wait_one(self.config.poll_timeout).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(worker_id = %self.id, "No message within poll timeout");
                return CycleOutcome::Idle;
            }
            Err(e) => {
                trail.enter(CycleState::Failed);
                error!(worker_id = %self.id, error = %e, "Failed to receive message");
                return CycleOutcome::Disconnected {
                    reason: e.to_string(),
                };
            }
        };

        trail.enter(CycleState::Processing);
        let item = match self.processor.extract(&message.body) {
            Ok(item) => item,
            Err(e) => {
                trail.enter(CycleState::Failed);
                error!(
                    worker_id = %self.id,
                    error = %e,
                    body_len = message.body.len(),
                    redelivered = message.redelivered,
                    "Dropping malformed message"
                );
                return self.fail(session, &message, None, e.into()).await;
            }
        };
        debug!(
            worker_id = %self.id,
            key = %item.key,
            redelivered = message.redelivered,
            "Message received"
        );

        trail.enter(CycleState::LockAcquiring);
        let lock = match session
            .locks
            .acquire(&item.key.lock_resource(), self.config.lock.ttl)
            .await
        {
            Ok(lock) => lock,
            Err(e) => {
                trail.enter(CycleState::Failed);
                warn!(worker_id = %self.id, key = %item.key, error = %e, "Lock not acquired");
                return self.fail(session, &message, Some(&item.key), e.into()).await;
            }
        };

        trail.enter(CycleState::Mutating);
        let committed = self.mutate(session.cache.as_ref(), &item, &lock).await;
        let released = session.locks.release(&lock).await;
        debug!(
            worker_id = %self.id,
            resource = lock.resource(),
            released = released,
            "Lock released"
        );

        let written = match committed {
            Ok(written) => written,
            Err(e) => {
                trail.enter(CycleState::Failed);
                warn!(worker_id = %self.id, key = %item.key, error = %e, "Cache mutation failed");
                return self.fail(session, &message, Some(&item.key), e).await;
            }
        };

        trail.enter(CycleState::Acking);
        if let Err(e) = self.settle(session, &message, Disposition::Ack).await {
            trail.enter(CycleState::Failed);
            error!(
                worker_id = %self.id,
                key = %item.key,
                error = %e,
                "Failed to acknowledge committed message"
            );
            return CycleOutcome::Disconnected {
                reason: e.to_string(),
            };
        }

        info!(worker_id = %self.id, key = %item.key, written = written, "Message processed");
        CycleOutcome::Acked {
            key: item.key.to_string(),
            written,
        }
    }

    /// Read-modify-write of the key's cache entry. Returns whether a write
    /// happened.
    async fn mutate(
        &self,
        cache: &dyn CacheClient,
        item: &WorkItem,
        lock: &Lock,
    ) -> Result<bool, ConsumerError> {
        let key = item.key.as_str();
        let current = cache.get(key).await?;
        let Some(entry) = item.next_entry(current.as_deref()) else {
            debug!(worker_id = %self.id, key = key, "Cache entry already up to date");
            return Ok(false);
        };
        let encoded = entry.to_json().map_err(|e| CacheError::Store {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        // The write must finish, or be abandoned, while the lock still holds.
        let write_timeout = self.config.cache.op_timeout;
        if lock.remaining() <= write_timeout {
            return Err(LockError::Expired {
                resource: lock.resource().to_string(),
            }
            .into());
        }
        match tokio::time::timeout(write_timeout, cache.set(key, &encoded)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CacheError::Timeout {
                    key: key.to_string(),
                    timeout: write_timeout,
                }
                .into())
            }
        }
        debug!(worker_id = %self.id, key = key, revision = entry.revision, "Cache entry committed");
        Ok(true)
    }

    async fn settle(
        &self,
        session: &mut WorkerSession,
        message: &QueueMessage,
        disposition: Disposition,
    ) -> Result<(), QueueError> {
        match disposition {
            Disposition::Ack => session.queue.ack(&message.handle).await,
            Disposition::Reject { requeue } => {
                session.queue.reject(&message.handle, requeue).await
            }
        }
    }

    /// Rejects `message` according to `err` and reports the outcome.
    async fn fail(
        &self,
        session: &mut WorkerSession,
        message: &QueueMessage,
        key: Option<&LogicalKey>,
        err: ConsumerError,
    ) -> CycleOutcome {
        let disposition = err.disposition();
        let requeue = matches!(disposition, Disposition::Reject { requeue: true });

        if let Err(settle_err) = self.settle(session, message, disposition).await {
            error!(
                worker_id = %self.id,
                error = %settle_err,
                requeue = requeue,
                "Failed to reject message"
            );
            return CycleOutcome::Disconnected {
                reason: settle_err.to_string(),
            };
        }

        if err.is_connection_loss() {
            return CycleOutcome::Disconnected {
                reason: err.to_string(),
            };
        }

        match (requeue, key) {
            (true, Some(key)) => CycleOutcome::Requeued {
                key: key.to_string(),
                reason: err.kind().to_string(),
            },
            _ => CycleOutcome::Dropped {
                reason: err.to_string(),
            },
        }
    }
}
