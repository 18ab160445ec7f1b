//! CLI command definitions for quorum-consumer.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{BrokerConfig, ConsumerConfig, LockConfig, ShardAddr};
use crate::error::ConfigError;
use crate::metrics::{export_metrics, init_metrics};
use crate::processor::JsonMessageProcessor;
use crate::worker::{
    BackgroundWorker, Connector, ConsumerWorker, RedisAmqpConnector, WorkerPool, WorkerPoolConfig,
};

/// Queue consumer that applies each message to a sharded cache under a
/// quorum lock and acknowledges only after the write committed.
#[derive(Parser)]
#[command(name = "quorum-consumer")]
#[command(about = "Consume queue messages into a sharded cache under a quorum lock")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Start the worker pool and consume until interrupted.
    Run(RunArgs),

    /// Report unmet environment requirements and exit non-zero if any.
    Check(CheckArgs),
}

/// Broker, cache and lock settings shared by every command.
#[derive(Parser, Debug, Clone)]
pub struct ConsumerArgs {
    /// Broker host.
    #[arg(long, env = "AMQP_HOST", default_value = "localhost")]
    pub amqp_host: String,

    /// Broker port.
    #[arg(long, env = "AMQP_PORT", default_value = "5672")]
    pub amqp_port: u16,

    /// Broker user.
    #[arg(long, env = "AMQP_USERNAME", default_value = "guest")]
    pub amqp_username: String,

    /// Broker password.
    #[arg(long, env = "AMQP_PASSWORD", default_value = "guest", hide_env_values = true)]
    pub amqp_password: String,

    /// Broker virtual host.
    #[arg(long, env = "AMQP_VHOST", default_value = "/")]
    pub amqp_vhost: String,

    /// Direct exchange messages are published to.
    #[arg(long, env = "AMQP_EXCHANGE", default_value = "router")]
    pub exchange: String,

    /// Durable queue to consume.
    #[arg(long, env = "AMQP_QUEUE", default_value = "msgs")]
    pub queue: String,

    /// Routing key binding the queue to the exchange.
    #[arg(long, env = "AMQP_BINDING_KEY", default_value = "")]
    pub binding_key: String,

    /// Consumer tag announced to the broker.
    #[arg(long, env = "AMQP_CONSUMER_TAG", default_value = "consumer")]
    pub consumer_tag: String,

    /// Comma-separated cache shards (host:port), in placement order.
    #[arg(long, env = "CACHE_SHARDS", default_value = "127.0.0.1:7000,127.0.0.1:7001,127.0.0.1:7002")]
    pub cache_shards: String,

    /// Ceiling for a single cache read or write, in milliseconds.
    #[arg(long, env = "CACHE_OP_TIMEOUT_MS", default_value = "500")]
    pub cache_op_timeout_ms: u64,

    /// Comma-separated lock shards. Defaults to the cache shards.
    #[arg(long, env = "LOCK_SHARDS")]
    pub lock_shards: Option<String>,

    /// Lock TTL in milliseconds.
    #[arg(long, env = "LOCK_TTL_MS", default_value = "10000")]
    pub lock_ttl_ms: u64,

    /// Quorum rounds before a message is requeued.
    #[arg(long, env = "LOCK_MAX_ATTEMPTS", default_value = "3")]
    pub lock_max_attempts: u32,

    /// First backoff step between lock rounds, in milliseconds.
    #[arg(long, env = "LOCK_RETRY_BASE_MS", default_value = "200")]
    pub lock_retry_base_ms: u64,

    /// Longest backoff step between lock rounds, in milliseconds.
    #[arg(long, env = "LOCK_RETRY_MAX_MS", default_value = "2000")]
    pub lock_retry_max_ms: u64,

    /// How long one receive waits for a message, in milliseconds.
    #[arg(long, env = "POLL_TIMEOUT_MS", default_value = "5000")]
    pub poll_timeout_ms: u64,

    /// Messages handled by one poll at most.
    #[arg(long, env = "MAX_MESSAGES_PER_POLL", default_value = "1")]
    pub max_messages_per_poll: usize,

    /// JSON field holding the logical key.
    #[arg(long, env = "KEY_FIELD", default_value = "sm_seq")]
    pub key_field: String,
}

impl ConsumerArgs {
    /// Builds the worker configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidShardAddress` for a malformed shard list.
    /// Semantic problems are left to `ConsumerConfig::validate`.
    pub fn to_config(&self) -> Result<ConsumerConfig, ConfigError> {
        let cache_shards = ShardAddr::parse_list(&self.cache_shards)?;
        let lock_shards = match &self.lock_shards {
            Some(list) => ShardAddr::parse_list(list)?,
            None => Vec::new(),
        };

        let broker = BrokerConfig {
            host: self.amqp_host.clone(),
            port: self.amqp_port,
            username: self.amqp_username.clone(),
            password: self.amqp_password.clone(),
            vhost: self.amqp_vhost.clone(),
            exchange: self.exchange.clone(),
            queue: self.queue.clone(),
            binding_key: self.binding_key.clone(),
            consumer_tag: self.consumer_tag.clone(),
        };
        let lock = LockConfig {
            shards: lock_shards,
            ttl: Duration::from_millis(self.lock_ttl_ms),
            max_attempts: self.lock_max_attempts,
            base_delay: Duration::from_millis(self.lock_retry_base_ms),
            max_delay: Duration::from_millis(self.lock_retry_max_ms),
            ..LockConfig::default()
        };

        Ok(ConsumerConfig::default()
            .with_broker(broker)
            .with_cache_shards(cache_shards)
            .with_cache_op_timeout(Duration::from_millis(self.cache_op_timeout_ms))
            .with_lock(lock)
            .with_poll_timeout(Duration::from_millis(self.poll_timeout_ms))
            .with_max_messages_per_poll(self.max_messages_per_poll)
            .with_key_field(self.key_field.clone()))
    }
}

/// Arguments for `quorum-consumer run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub consumer: ConsumerArgs,

    /// Number of concurrent workers.
    #[arg(short = 'w', long, env = "WORKERS", default_value = "2")]
    pub workers: usize,

    /// Ceiling for a single poll, in seconds.
    #[arg(long, default_value = "30")]
    pub cycle_timeout_secs: u64,

    /// Pause between polls of the same worker, in seconds.
    #[arg(long, default_value = "3")]
    pub loop_interval_secs: u64,

    /// Print Prometheus metrics on shutdown.
    #[arg(long)]
    pub print_metrics: bool,
}

/// Arguments for `quorum-consumer check`.
#[derive(Parser, Debug)]
pub struct CheckArgs {
    #[command(flatten)]
    pub consumer: ConsumerArgs,

    /// Also try to connect to the broker and every shard.
    #[arg(long)]
    pub probe: bool,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_consumer_command(args).await,
        Commands::Check(args) => run_check_command(args).await,
    }
}

async fn run_consumer_command(args: RunArgs) -> anyhow::Result<()> {
    let config = args.consumer.to_config()?;
    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            warn!(problem = %problem, "Invalid configuration");
        }
        anyhow::bail!("{} configuration problem(s) found", problems.len());
    }

    init_metrics()?;

    let pool_config = WorkerPoolConfig::new(args.workers)
        .with_cycle_timeout(Duration::from_secs(args.cycle_timeout_secs))
        .with_loop_interval(Duration::from_secs(args.loop_interval_secs));
    if config.max_poll_duration() > pool_config.cycle_timeout {
        warn!(
            max_poll_ms = config.max_poll_duration().as_millis() as u64,
            cycle_timeout_ms = pool_config.cycle_timeout.as_millis() as u64,
            "A slow poll can be cut by the cycle timeout"
        );
    }

    let connector: Arc<dyn Connector> = Arc::new(RedisAmqpConnector);
    let processor = Arc::new(JsonMessageProcessor::new(config.key_field.clone()));
    let tag = config.broker.consumer_tag.clone();
    let mut pool = WorkerPool::new(pool_config, move |i| {
        ConsumerWorker::new(config.clone(), Arc::clone(&connector), processor.clone())
            .with_id(format!("{tag}-{i}"))
    });

    pool.start()?;
    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, stopping workers");
    pool.shutdown().await?;

    let stats = pool.stats();
    info!(
        polls = stats.polls_completed,
        timeouts = stats.poll_timeouts,
        setup_failures = stats.setup_failures,
        "Worker pool stopped"
    );
    for (worker_id, results) in pool.last_results() {
        info!(
            worker_id = %worker_id,
            acked = results.acked,
            requeued = results.requeued,
            dropped = results.dropped,
            "Final worker tally"
        );
    }
    if args.print_metrics {
        print!("{}", export_metrics());
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct CheckOutput {
    status: &'static str,
    problems: Vec<String>,
}

async fn run_check_command(args: CheckArgs) -> anyhow::Result<()> {
    let problems = match args.consumer.to_config() {
        Ok(config) => check_config(config, args.probe).await,
        Err(e) => vec![e.to_string()],
    };

    if args.json {
        let output = CheckOutput {
            status: if problems.is_empty() { "ok" } else { "failed" },
            problems: problems.clone(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if problems.is_empty() {
        println!("Environment OK");
    } else {
        for problem in &problems {
            println!("- {}", problem);
        }
    }

    if !problems.is_empty() {
        anyhow::bail!("{} unmet requirement(s)", problems.len());
    }
    Ok(())
}

async fn check_config(config: ConsumerConfig, probe: bool) -> Vec<String> {
    let processor = Arc::new(JsonMessageProcessor::new(config.key_field.clone()));
    let mut worker = ConsumerWorker::new(config, Arc::new(RedisAmqpConnector), processor);
    let mut problems = worker.check_environment();

    if probe && problems.is_empty() {
        match worker.connect().await {
            Ok(()) => worker.teardown().await,
            Err(e) => problems.push(format!("Connection probe failed: {}", e)),
        }
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_defaults() {
        let cli = Cli::try_parse_from(["quorum-consumer", "run"]).expect("should parse");

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.workers, 2);
                assert_eq!(args.cycle_timeout_secs, 30);
                assert_eq!(args.loop_interval_secs, 3);

                let config = args.consumer.to_config().expect("valid defaults");
                assert!(config.validate().is_empty());
                assert_eq!(config.broker.queue, "msgs");
                assert_eq!(config.cache.shards.len(), 3);
                assert_eq!(config.lock.ttl, Duration::from_millis(10_000));
                assert_eq!(config.cache.op_timeout, Duration::from_millis(500));
                assert!(config.max_poll_duration() < Duration::from_secs(args.cycle_timeout_secs));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_check_command_with_overrides() {
        let cli = Cli::try_parse_from([
            "quorum-consumer",
            "check",
            "--cache-shards",
            "r1:7000,r2:7000,r3:7000,r4:7000",
            "--lock-shards",
            "l1:7000",
            "--lock-ttl-ms",
            "2500",
            "--cache-op-timeout-ms",
            "250",
            "--json",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Check(args) => {
                assert!(args.json);
                let config = args.consumer.to_config().expect("valid shards");
                assert_eq!(config.cache.shards.len(), 4);
                assert_eq!(config.lock_shards().len(), 1);
                assert_eq!(config.lock.ttl, Duration::from_millis(2500));
                assert_eq!(config.cache.op_timeout, Duration::from_millis(250));
            }
            _ => panic!("Expected Check command"),
        }
    }

    #[test]
    fn test_bad_shard_list_is_rejected() {
        let cli = Cli::try_parse_from(["quorum-consumer", "check", "--cache-shards", "nohost"])
            .expect("should parse");
        match cli.command {
            Commands::Check(args) => assert!(args.consumer.to_config().is_err()),
            _ => panic!("Expected Check command"),
        }
    }

    #[tokio::test]
    async fn test_check_config_reports_even_lock_shards() {
        let config = ConsumerConfig::default()
            .with_cache_shards(vec![ShardAddr::new("a", 1), ShardAddr::new("b", 2)]);
        let problems = check_config(config, true).await;
        // Validation fails first, so no connection is attempted.
        assert_eq!(problems.len(), 1);
    }
}
