//! Consumer worker and its runner.
//!
//! - **ConsumerWorker**: runs one message per cycle through receive, extract,
//!   lock, mutate, release, ack
//! - **BackgroundWorker**: the setup/poll/check_environment/teardown contract
//!   a host runner drives
//! - **WorkerPool**: minimal in-process runner used by the binary
//! - **Connector**: opens the broker, cache and lock connections a worker
//!   session needs

pub mod consumer;
pub mod lifecycle;
pub mod memory;
pub mod pool;

pub use consumer::{
    Connector, ConsumerWorker, CycleOutcome, CycleReport, CycleState, PollResults,
    RedisAmqpConnector, WorkerSession,
};
pub use lifecycle::BackgroundWorker;
pub use memory::InMemoryConnector;
pub use pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
