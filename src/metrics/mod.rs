//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks how messages are settled, how the quorum lock behaves under
//! contention, and how long poll cycles take.
//!
//! # Example
//!
//! ```ignore
//! use quorum_consumer::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_message("acked");
//! collector.record_lock("acquired", 1);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, CYCLE_DURATION, LOCK_ACQUISITIONS_TOTAL, LOCK_ATTEMPTS, MESSAGES_TOTAL,
    POLL_TIMEOUTS_TOTAL, RECONNECTS_TOTAL, REGISTRY,
};
