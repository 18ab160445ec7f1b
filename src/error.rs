//! Error types for quorum-consumer operations.
//!
//! Defines error types for each subsystem:
//! - Queue broker sessions and delivery settlement
//! - Sharded cache reads and writes
//! - Quorum lock acquisition
//! - Message extraction
//! - Configuration validation
//!
//! `ConsumerError` aggregates all of them at the worker boundary and decides
//! how the in-flight message is settled.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to the message broker.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Broker unreachable or the session was lost.
    #[error("Broker connection failed: {0}")]
    Connection(String),

    /// Caller misuse, e.g. settling the same delivery twice.
    #[error("Queue protocol violation: {0}")]
    Protocol(String),

    /// The broker refused an operation on a live session.
    #[error("Broker operation failed: {0}")]
    Broker(String),
}

impl From<lapin::Error> for QueueError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::IOError(_) => QueueError::Connection(err.to_string()),
            other => QueueError::Broker(other.to_string()),
        }
    }
}

/// Errors that can occur during cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Cache shard unreachable.
    #[error("Cache connection failed: {0}")]
    Connection(String),

    /// The shard accepted the connection but the command failed.
    #[error("Cache store failed for key '{key}': {reason}")]
    Store { key: String, reason: String },

    /// The per-call timeout elapsed.
    #[error("Cache operation on key '{key}' timed out after {timeout:?}")]
    Timeout { key: String, timeout: Duration },
}

impl CacheError {
    pub(crate) fn from_redis(key: &str, err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            CacheError::Connection(err.to_string())
        } else {
            CacheError::Store {
                key: key.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

/// Errors that can occur during distributed lock operations.
///
/// Failing a single quorum round is not an error; only exhausting the retry
/// budget is.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock on '{resource}' not acquired after {attempts} attempts")]
    Timeout { resource: String, attempts: u32 },

    /// The lock validity ran out before the protected write could start.
    #[error("Lock on '{resource}' expired before the critical section completed")]
    Expired { resource: String },

    /// A single shard failed. Counted as a rejection by the coordinator.
    #[error("Lock shard '{shard}' failed: {reason}")]
    Shard { shard: String, reason: String },
}

/// Errors that can occur while extracting a work item from a message body.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Malformed message: empty body")]
    EmptyBody,

    #[error("Malformed message: body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Malformed message: body must be a JSON object")]
    NotAnObject,

    #[error("Malformed message: missing or empty key field '{0}'")]
    MissingKey(String),
}

/// Errors found while validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid shard address '{0}': expected host:port")]
    InvalidShardAddress(String),

    #[error("At least one {0} shard is required")]
    NoShards(&'static str),

    #[error("Lock shard count must be odd, got {0}")]
    EvenShardCount(usize),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Every failure a poll cycle can hit, as seen by the consumer worker.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// How an in-flight message is settled after a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject { requeue: bool },
}

impl ConsumerError {
    /// Maps the failure onto the settlement of the message that caused it.
    ///
    /// Poison messages are dropped; lock contention and cache failures are
    /// retryable and go back on the queue.
    pub fn disposition(&self) -> Disposition {
        match self {
            ConsumerError::Message(_) => Disposition::Reject { requeue: false },
            _ => Disposition::Reject { requeue: true },
        }
    }

    /// Whether the session that produced this error is no longer usable.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            ConsumerError::Queue(QueueError::Connection(_))
                | ConsumerError::Cache(CacheError::Connection(_))
        )
    }

    /// Short label used for metrics and the cycle outcome.
    pub fn kind(&self) -> &'static str {
        match self {
            ConsumerError::Queue(QueueError::Connection(_))
            | ConsumerError::Cache(CacheError::Connection(_)) => "connection",
            ConsumerError::Queue(QueueError::Protocol(_)) => "protocol",
            ConsumerError::Queue(QueueError::Broker(_)) => "broker",
            ConsumerError::Cache(_) => "store",
            ConsumerError::Lock(LockError::Timeout { .. }) => "lock_timeout",
            ConsumerError::Lock(_) => "lock_lost",
            ConsumerError::Message(_) => "malformed",
            ConsumerError::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_message_is_dropped() {
        let err = ConsumerError::from(MessageError::EmptyBody);
        assert_eq!(err.disposition(), Disposition::Reject { requeue: false });
        assert_eq!(err.kind(), "malformed");
    }

    #[test]
    fn test_transient_failures_are_requeued() {
        let lock = ConsumerError::from(LockError::Timeout {
            resource: "order-42.lock".to_string(),
            attempts: 3,
        });
        assert_eq!(lock.disposition(), Disposition::Reject { requeue: true });

        let store = ConsumerError::from(CacheError::Store {
            key: "order-42".to_string(),
            reason: "READONLY".to_string(),
        });
        assert_eq!(store.disposition(), Disposition::Reject { requeue: true });
        assert!(!store.is_connection_loss());
    }

    #[test]
    fn test_connection_loss_detection() {
        let err = ConsumerError::from(QueueError::Connection("reset".to_string()));
        assert!(err.is_connection_loss());
        assert_eq!(err.kind(), "connection");

        let err = ConsumerError::from(QueueError::Protocol("double ack".to_string()));
        assert!(!err.is_connection_loss());
        assert_eq!(err.kind(), "protocol");
    }

    #[test]
    fn test_error_display() {
        let err = LockError::Timeout {
            resource: "order-42.lock".to_string(),
            attempts: 5,
        };
        assert!(err.to_string().contains("order-42.lock"));
        assert!(err.to_string().contains('5'));

        let err = CacheError::Timeout {
            key: "k".to_string(),
            timeout: Duration::from_millis(250),
        };
        assert!(err.to_string().contains("250ms"));

        let err = ConfigError::EvenShardCount(4);
        assert!(err.to_string().contains('4'));
    }
}
