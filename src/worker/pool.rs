//! In-process runner for a fixed set of background workers.
//!
//! Each worker runs as an independent task:
//!
//! - `setup` once, then `poll` in a loop, each call bounded by the cycle timeout
//! - A sleep of `loop_interval` between polls
//! - `teardown` once a shutdown signal arrives on the broadcast channel
//!
//! A poll that outlives the cycle timeout is abandoned and counted. The
//! results it recorded before the cut are kept. Anything it held (an
//! unsettled delivery, a lock) is reclaimed by the broker and the
//! lock TTL, not by the pool.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::lifecycle::BackgroundWorker;
use crate::metrics::MetricsCollector;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Ceiling for a single poll.
    pub cycle_timeout: Duration,
    /// Pause between two polls of the same worker.
    pub loop_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            cycle_timeout: Duration::from_secs(30),
            loop_interval: Duration::from_secs(3),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the per-poll timeout.
    pub fn with_cycle_timeout(mut self, timeout: Duration) -> Self {
        self.cycle_timeout = timeout;
        self
    }

    /// Sets the pause between polls.
    pub fn with_loop_interval(mut self, interval: Duration) -> Self {
        self.loop_interval = interval;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Workers past `setup` and not yet torn down.
    pub active_workers: usize,
    /// Polls that returned within the cycle timeout.
    pub polls_completed: u64,
    /// Polls abandoned by the cycle timeout.
    pub poll_timeouts: u64,
    /// Workers whose `setup` failed.
    pub setup_failures: u64,
}

impl PoolStats {
    /// Returns the total number of polls started.
    pub fn total_polls(&self) -> u64 {
        self.polls_completed + self.poll_timeouts
    }

    /// Returns the share of polls that hit the timeout, as a percentage.
    pub fn timeout_rate(&self) -> f64 {
        let total = self.total_polls();
        if total == 0 {
            return 0.0;
        }
        (self.poll_timeouts as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    polls_completed: AtomicU64,
    poll_timeouts: AtomicU64,
    setup_failures: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            polls_completed: AtomicU64::new(0),
            poll_timeouts: AtomicU64::new(0),
            setup_failures: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_poll(&self) {
        self.polls_completed.fetch_add(1, Ordering::SeqCst);
    }

    fn record_timeout(&self) {
        self.poll_timeouts.fetch_add(1, Ordering::SeqCst);
    }

    fn record_setup_failure(&self) {
        self.setup_failures.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            polls_completed: self.polls_completed.load(Ordering::SeqCst),
            poll_timeouts: self.poll_timeouts.load(Ordering::SeqCst),
            setup_failures: self.setup_failures.load(Ordering::SeqCst),
        }
    }
}

type WorkerFactory<W> = Box<dyn Fn(usize) -> W + Send + Sync>;
type ResultStore<R> = Arc<Mutex<BTreeMap<String, R>>>;

/// Pool that runs `num_workers` copies of a background worker.
pub struct WorkerPool<W: BackgroundWorker + 'static> {
    config: WorkerPoolConfig,
    factory: WorkerFactory<W>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    results: ResultStore<W::Results>,
    is_running: AtomicBool,
}

impl<W: BackgroundWorker + 'static> WorkerPool<W> {
    /// Creates a pool that builds worker `i` with `factory(i)` on start.
    pub fn new(config: WorkerPoolConfig, factory: impl Fn(usize) -> W + Send + Sync + 'static) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            factory: Box::new(factory),
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            results: Arc::new(Mutex::new(BTreeMap::new())),
            is_running: AtomicBool::new(false),
        }
    }

    /// Spawns all workers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        for i in 0..self.config.num_workers {
            let task = WorkerTask {
                id: format!("worker-{}", i),
                worker: (self.factory)(i),
                shutdown_rx: self.shutdown_tx.subscribe(),
                cycle_timeout: self.config.cycle_timeout,
                loop_interval: self.config.loop_interval,
                stats: Arc::clone(&self.stats),
                results: Arc::clone(&self.results),
                metrics: MetricsCollector::new(),
            };

            self.worker_handles.push(tokio::spawn(task.run()));
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(num_workers = self.config.num_workers, "Worker pool started");

        Ok(())
    }

    /// Signals every worker to stop and waits for their teardown.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let outcome = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        match outcome {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Latest results recorded by each worker, keyed by worker id.
    pub fn last_results(&self) -> BTreeMap<String, W::Results> {
        self.results
            .lock()
            .map(|results| results.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// One spawned worker and its loop state.
struct WorkerTask<W: BackgroundWorker> {
    id: String,
    worker: W,
    shutdown_rx: broadcast::Receiver<()>,
    cycle_timeout: Duration,
    loop_interval: Duration,
    stats: Arc<SharedPoolStats>,
    results: ResultStore<W::Results>,
    metrics: MetricsCollector,
}

impl<W: BackgroundWorker> WorkerTask<W> {
    async fn run(mut self) {
        for problem in self.worker.check_environment() {
            warn!(worker_id = %self.id, problem = %problem, "Unmet environment requirement");
        }

        if let Err(e) = self.worker.setup().await {
            error!(worker_id = %self.id, error = %e, "Worker setup failed");
            self.stats.record_setup_failure();
            return;
        }

        self.stats.increment_active();
        self.metrics.inc_workers();
        info!(worker_id = %self.id, "Worker started");

        let mut results = W::Results::default();
        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            let finished = tokio::time::timeout(self.cycle_timeout, self.worker.poll(&mut results))
                .await
                .is_ok();
            // An abandoned poll still keeps the cycles it completed.
            self.store(&results);
            if finished {
                self.stats.record_poll();
            } else {
                warn!(
                    worker_id = %self.id,
                    timeout_ms = self.cycle_timeout.as_millis() as u64,
                    "Poll timeout reached"
                );
                self.stats.record_timeout();
                self.metrics.record_poll_timeout();
            }

            tokio::select! {
                _ = tokio::time::sleep(self.loop_interval) => {}
                _ = self.shutdown_rx.recv() => break,
            }
        }

        debug!(worker_id = %self.id, "Worker received shutdown signal");
        self.worker.teardown().await;
        self.stats.decrement_active();
        self.metrics.dec_workers();
        info!(worker_id = %self.id, "Worker stopped");
    }

    fn store(&self, latest: &W::Results) {
        let mut results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        results.insert(self.id.clone(), latest.clone());
    }
}
