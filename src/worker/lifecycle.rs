//! Lifecycle contract between a worker and the runner that hosts it.

use async_trait::async_trait;

use super::consumer::{ConsumerWorker, PollResults};
use crate::error::ConsumerError;

/// Entry points a host runner drives.
///
/// The runner calls `check_environment` before activation, `setup` once,
/// `poll` repeatedly (each call under its own timeout), and `teardown` once
/// at shutdown. The runner owns the results and hands the same tally to every
/// poll.
#[async_trait]
pub trait BackgroundWorker: Send {
    /// Tally carried from one poll to the next.
    type Results: Clone + Default + Send + 'static;

    /// Unmet requirements, empty when the worker may start.
    fn check_environment(&self) -> Vec<String>;

    async fn setup(&mut self) -> Result<(), ConsumerError>;

    /// Runs one unit of work. Must not fail: every problem is folded into
    /// `results` as soon as it happens, so a poll cut short by the runner
    /// keeps what it already recorded.
    async fn poll(&mut self, results: &mut Self::Results);

    async fn teardown(&mut self);
}

#[async_trait]
impl BackgroundWorker for ConsumerWorker {
    type Results = PollResults;

    fn check_environment(&self) -> Vec<String> {
        self.config()
            .validate()
            .into_iter()
            .map(|problem| problem.to_string())
            .collect()
    }

    /// Validates the configuration and tries a first connection.
    ///
    /// A broker or cache that is down at startup is not fatal; the first poll
    /// retries under the reconnect backoff.
    async fn setup(&mut self) -> Result<(), ConsumerError> {
        if let Some(problem) = self.config().validate().into_iter().next() {
            return Err(problem.into());
        }
        if let Err(e) = self.connect().await {
            if matches!(e, ConsumerError::Config(_)) {
                return Err(e);
            }
            tracing::warn!(worker_id = %self.id(), error = %e, "Starting disconnected");
        }
        Ok(())
    }

    /// Runs up to `max_messages_per_poll` cycles, stopping early when the
    /// queue is idle or the session is lost.
    async fn poll(&mut self, results: &mut PollResults) {
        for _ in 0..self.config().max_messages_per_poll.max(1) {
            let report = self.run_cycle().await;
            results.record(&report);
            if !report.outcome.settled_message() {
                break;
            }
        }
    }

    async fn teardown(&mut self) {
        self.disconnect().await;
        tracing::info!(worker_id = %self.id(), "Consumer stopped");
    }
}
