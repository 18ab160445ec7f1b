//! Prometheus metrics registration and export.
//!
//! All metrics live in `OnceLock` statics so recording from any worker task is
//! a cheap lookup, and recording before `init_metrics()` is a no-op.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, IntCounter, Opts,
    Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all quorum_consumer metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Messages settled, labeled by outcome (acked, requeued, dropped).
pub static MESSAGES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Lock acquisitions, labeled by result (acquired, timeout).
pub static LOCK_ACQUISITIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Quorum rounds needed per acquisition call.
pub static LOCK_ATTEMPTS: OnceLock<Histogram> = OnceLock::new();

/// Poll cycle duration in seconds, labeled by outcome.
pub static CYCLE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Session (re)connection attempts, labeled by result.
pub static RECONNECTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Polls abandoned by the runner's cycle ceiling.
pub static POLL_TIMEOUTS_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Number of worker tasks currently running.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if a metric definition is invalid.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let messages_total = CounterVec::new(
        Opts::new("quorum_consumer_messages_total", "Messages settled by outcome"),
        &["outcome"],
    )?;

    let lock_acquisitions_total = CounterVec::new(
        Opts::new(
            "quorum_consumer_lock_acquisitions_total",
            "Lock acquisition calls by result",
        ),
        &["result"],
    )?;

    let lock_attempts = Histogram::with_opts(
        HistogramOpts::new(
            "quorum_consumer_lock_attempts",
            "Quorum rounds per lock acquisition call",
        )
        .buckets(vec![1.0, 2.0, 3.0, 5.0, 8.0, 13.0]),
    )?;

    let cycle_duration = HistogramVec::new(
        HistogramOpts::new(
            "quorum_consumer_cycle_duration_seconds",
            "Poll cycle duration in seconds",
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        &["outcome"],
    )?;

    let reconnects_total = CounterVec::new(
        Opts::new(
            "quorum_consumer_reconnects_total",
            "Session connection attempts by result",
        ),
        &["result"],
    )?;

    let poll_timeouts_total = IntCounter::new(
        "quorum_consumer_poll_timeouts_total",
        "Polls abandoned by the cycle ceiling",
    )?;

    let active_workers = Gauge::new("quorum_consumer_active_workers", "Number of active workers")?;

    registry.register(Box::new(messages_total.clone()))?;
    registry.register(Box::new(lock_acquisitions_total.clone()))?;
    registry.register(Box::new(lock_attempts.clone()))?;
    registry.register(Box::new(cycle_duration.clone()))?;
    registry.register(Box::new(reconnects_total.clone()))?;
    registry.register(Box::new(poll_timeouts_total.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = MESSAGES_TOTAL.set(messages_total);
    let _ = LOCK_ACQUISITIONS_TOTAL.set(lock_acquisitions_total);
    let _ = LOCK_ATTEMPTS.set(lock_attempts);
    let _ = CYCLE_DURATION.set(cycle_duration);
    let _ = RECONNECTS_TOTAL.set(reconnects_total);
    let _ = POLL_TIMEOUTS_TOTAL.set(poll_timeouts_total);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line instead when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();
        if let Some(messages) = MESSAGES_TOTAL.get() {
            messages.with_label_values(&["acked"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        if REGISTRY.get().is_some() {
            assert!(!metrics.starts_with("# Error"));
            assert!(metrics.contains("quorum_consumer_messages_total"));
        }
    }
}
