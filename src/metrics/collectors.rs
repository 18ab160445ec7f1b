//! High-level recording interface over the raw Prometheus metrics.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_WORKERS, CYCLE_DURATION, LOCK_ACQUISITIONS_TOTAL, LOCK_ATTEMPTS, MESSAGES_TOTAL,
    POLL_TIMEOUTS_TOTAL, RECONNECTS_TOTAL,
};

/// Metrics collector for consumer operational metrics.
///
/// Zero-sized; every method looks up the global metric and silently skips
/// recording if `init_metrics()` has not run.
///
/// # Example
///
/// ```ignore
/// let collector = MetricsCollector::new();
/// collector.record_message("requeued");
/// collector.record_cycle("acked", Duration::from_millis(12));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record how a message was settled (`acked`, `requeued`, `dropped`).
    pub fn record_message(&self, outcome: &str) {
        if let Some(messages) = MESSAGES_TOTAL.get() {
            messages.with_label_values(&[outcome]).inc();
        }

        tracing::trace!(outcome = outcome, "Recorded message metric");
    }

    /// Record the end of a lock acquisition call.
    ///
    /// # Arguments
    ///
    /// * `result` - `acquired` or `timeout`
    /// * `attempts` - Quorum rounds the call ran
    pub fn record_lock(&self, result: &str, attempts: u32) {
        if let Some(acquisitions) = LOCK_ACQUISITIONS_TOTAL.get() {
            acquisitions.with_label_values(&[result]).inc();
        }

        if let Some(histogram) = LOCK_ATTEMPTS.get() {
            histogram.observe(f64::from(attempts));
        }

        tracing::trace!(result = result, attempts = attempts, "Recorded lock metric");
    }

    /// Record one poll cycle.
    pub fn record_cycle(&self, outcome: &str, duration: Duration) {
        if let Some(cycles) = CYCLE_DURATION.get() {
            cycles
                .with_label_values(&[outcome])
                .observe(duration.as_secs_f64());
        }
    }

    /// Record a session connection attempt.
    pub fn record_reconnect(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        if let Some(reconnects) = RECONNECTS_TOTAL.get() {
            reconnects.with_label_values(&[result]).inc();
        }
    }

    /// Record a poll abandoned by the cycle ceiling.
    pub fn record_poll_timeout(&self) {
        if let Some(timeouts) = POLL_TIMEOUTS_TOTAL.get() {
            timeouts.inc();
        }
    }

    /// Increment the count of running workers by 1.
    pub fn inc_workers(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.inc();
        }
    }

    /// Decrement the count of running workers by 1.
    pub fn dec_workers(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.dec();
        }
    }
}
