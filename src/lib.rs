//! quorum-consumer: at-least-once queue consumer with quorum-locked cache writes.
//!
//! Each worker takes one message at a time from a durable AMQP queue, derives
//! a logical key from it, takes a majority lock on that key across independent
//! Redis shards, applies the change to a sharded cache, and acknowledges the
//! message only after the write committed.

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod worker;

// Re-export commonly used types
pub use config::ConsumerConfig;
pub use error::{CacheError, ConfigError, ConsumerError, LockError, MessageError, QueueError};
pub use lock::{Lock, LockCoordinator};
pub use worker::{BackgroundWorker, ConsumerWorker, CycleOutcome, PollResults};
