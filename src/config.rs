//! Static configuration handed to the consumer at `setup()` time.
//!
//! Topology names (exchange, queue, consumer tag) are fields here so they can
//! change without a rebuild.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::lock::RetryPolicy;

/// A single `host:port` shard address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardAddr {
    pub host: String,
    pub port: u16,
}

impl ShardAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Connection URL understood by the redis client.
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }

    /// Parses a comma-separated shard list, preserving order.
    pub fn parse_list(list: &str) -> Result<Vec<Self>, ConfigError> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for ShardAddr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidShardAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(ConfigError::InvalidShardAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidShardAddress(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for ShardAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Broker connection and topology settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub vhost: String,
    /// Durable direct exchange messages are routed through.
    pub exchange: String,
    /// Durable queue this consumer drains.
    pub queue: String,
    /// Routing key binding the queue to the exchange.
    pub binding_key: String,
    /// Fixed tag the consumer identifies itself with.
    pub consumer_tag: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            exchange: "router".to_string(),
            queue: "msgs".to_string(),
            binding_key: String::new(),
            consumer_tag: "consumer".to_string(),
        }
    }
}

impl BrokerConfig {
    /// AMQP URI for this broker. The vhost is percent-encoded.
    pub fn amqp_uri(&self) -> String {
        let vhost = if self.vhost == "/" {
            "%2f".to_string()
        } else {
            urlencoding::encode(&self.vhost).into_owned()
        };
        format!(
            "amqp://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            vhost
        )
    }
}

/// Cache shard topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Ordered shard list; the order defines the key-to-shard mapping.
    pub shards: Vec<ShardAddr>,
    /// Ceiling for a single get or set.
    pub op_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shards: vec![
                ShardAddr::new("127.0.0.1", 7000),
                ShardAddr::new("127.0.0.1", 7001),
                ShardAddr::new("127.0.0.1", 7002),
            ],
            op_timeout: Duration::from_millis(500),
        }
    }
}

/// Quorum lock settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Independent lock shards. Empty means reuse the cache shards.
    pub shards: Vec<ShardAddr>,
    /// Lock validity.
    pub ttl: Duration,
    /// Quorum rounds before giving up with a lock timeout.
    pub max_attempts: u32,
    /// First backoff step between rounds.
    pub base_delay: Duration,
    /// Upper bound for a single backoff step.
    pub max_delay: Duration,
    /// Fraction of the TTL assumed lost to clock drift.
    pub drift_factor: f64,
    /// Ceiling for a single shard call inside a round.
    pub shard_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            shards: Vec::new(),
            ttl: Duration::from_millis(10_000),
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            drift_factor: 0.01,
            shard_timeout: Duration::from_millis(50),
        }
    }
}

impl LockConfig {
    /// Fixed drift margin subtracted from every computed validity.
    pub fn drift_margin(&self) -> Duration {
        drift_margin(self.ttl, self.drift_factor)
    }
}

/// `ttl * factor + 2ms`.
///
/// A factor that cannot be applied (infinite, or overflowing) yields a margin
/// of the whole TTL, which leaves no lock validity.
pub fn drift_margin(ttl: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(ttl.as_secs_f64() * factor.max(0.0))
        .unwrap_or(ttl)
        .saturating_add(Duration::from_millis(2))
}

/// Complete configuration for one consumer worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub broker: BrokerConfig,
    pub cache: CacheConfig,
    pub lock: LockConfig,
    /// How long one receive waits for a delivery.
    pub poll_timeout: Duration,
    /// Upper bound on messages handled by a single `poll`.
    pub max_messages_per_poll: usize,
    /// JSON field holding the logical key.
    pub key_field: String,
    /// First wait after a failed connection attempt.
    pub reconnect_base: Duration,
    /// Longest wait between connection attempts.
    pub reconnect_max: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            cache: CacheConfig::default(),
            lock: LockConfig::default(),
            poll_timeout: Duration::from_secs(5),
            max_messages_per_poll: 1,
            key_field: "sm_seq".to_string(),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

impl ConsumerConfig {
    /// Sets the broker settings.
    pub fn with_broker(mut self, broker: BrokerConfig) -> Self {
        self.broker = broker;
        self
    }

    /// Sets the cache shard list.
    pub fn with_cache_shards(mut self, shards: Vec<ShardAddr>) -> Self {
        self.cache.shards = shards;
        self
    }

    /// Sets the lock settings.
    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Sets the ceiling for a single cache call.
    pub fn with_cache_op_timeout(mut self, timeout: Duration) -> Self {
        self.cache.op_timeout = timeout;
        self
    }

    /// Sets the receive timeout.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Sets the batch size of a single poll.
    pub fn with_max_messages_per_poll(mut self, max: usize) -> Self {
        self.max_messages_per_poll = max;
        self
    }

    /// Sets the JSON field the logical key is read from.
    pub fn with_key_field(mut self, field: impl Into<String>) -> Self {
        self.key_field = field.into();
        self
    }

    /// Sets the reconnect backoff bounds.
    pub fn with_reconnect_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base = base;
        self.reconnect_max = max;
        self
    }

    /// Lock shards in effect, falling back to the cache shards.
    pub fn lock_shards(&self) -> &[ShardAddr] {
        if self.lock.shards.is_empty() {
            &self.cache.shards
        } else {
            &self.lock.shards
        }
    }

    /// Shortest lock TTL that still covers a cache read and a cache write,
    /// each at its timeout, plus the drift margin.
    pub fn min_lock_ttl(&self) -> Duration {
        self.cache
            .op_timeout
            .saturating_mul(2)
            .saturating_add(self.lock.drift_margin())
    }

    /// Longest a single `poll` can run when every step waits out its timeout.
    ///
    /// Broker settlement is not bounded here and comes on top.
    pub fn max_poll_duration(&self) -> Duration {
        let lock = &self.lock;
        let rounds = lock
            .shard_timeout
            .saturating_mul(lock.max_attempts)
            .saturating_add(RetryPolicy::from(lock).max_backoff(lock.ttl));
        let cycle = self
            .poll_timeout
            .saturating_add(rounds)
            .saturating_add(self.cache.op_timeout.saturating_mul(2))
            .saturating_add(lock.shard_timeout);
        cycle.saturating_mul(u32::try_from(self.max_messages_per_poll).unwrap_or(u32::MAX))
    }

    /// Returns every problem found, empty when the configuration is usable.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut problems = Vec::new();

        for (name, value) in [
            ("broker host", &self.broker.host),
            ("exchange name", &self.broker.exchange),
            ("queue name", &self.broker.queue),
            ("consumer tag", &self.broker.consumer_tag),
            ("key field", &self.key_field),
        ] {
            if value.trim().is_empty() {
                problems.push(ConfigError::Invalid(format!("{name} must not be empty")));
            }
        }

        if self.cache.shards.is_empty() {
            problems.push(ConfigError::NoShards("cache"));
        }

        let lock_shards = self.lock_shards().len();
        if lock_shards == 0 {
            problems.push(ConfigError::NoShards("lock"));
        } else if lock_shards % 2 == 0 {
            problems.push(ConfigError::EvenShardCount(lock_shards));
        }

        let factor = self.lock.drift_factor;
        if !(factor.is_finite() && (0.0..1.0).contains(&factor)) {
            problems.push(ConfigError::Invalid(format!(
                "lock drift_factor {factor} must be finite and in [0, 1)"
            )));
        } else if self.lock.ttl <= self.min_lock_ttl() {
            problems.push(ConfigError::Invalid(format!(
                "lock ttl {:?} must exceed two cache operations plus the drift margin ({:?})",
                self.lock.ttl,
                self.min_lock_ttl()
            )));
        }
        if self.lock.max_attempts == 0 {
            problems.push(ConfigError::Invalid(
                "lock max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_messages_per_poll == 0 {
            problems.push(ConfigError::Invalid(
                "max_messages_per_poll must be at least 1".to_string(),
            ));
        }

        problems
    }
}
