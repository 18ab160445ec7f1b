//! End-to-end consumer cycles against the in-memory broker, cache and lock
//! shards.

use std::sync::Arc;
use std::time::Duration;

use quorum_consumer::cache::InMemoryCache;
use quorum_consumer::config::{ConsumerConfig, LockConfig};
use quorum_consumer::lock::{LockCoordinator, LockShard};
use quorum_consumer::processor::{CacheEntry, JsonMessageProcessor};
use quorum_consumer::queue::InMemoryBroker;
use quorum_consumer::worker::{
    BackgroundWorker, ConsumerWorker, CycleOutcome, InMemoryConnector, PollResults, WorkerPool,
    WorkerPoolConfig,
};

fn lock_config(max_attempts: u32) -> LockConfig {
    LockConfig {
        ttl: Duration::from_secs(2),
        max_attempts,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        ..LockConfig::default()
    }
}

fn config(max_attempts: u32) -> ConsumerConfig {
    ConsumerConfig::default()
        .with_poll_timeout(Duration::from_millis(20))
        .with_lock(lock_config(max_attempts))
        .with_reconnect_backoff(Duration::from_millis(10), Duration::from_millis(20))
}

fn connector() -> InMemoryConnector {
    InMemoryConnector::new(InMemoryBroker::new(), InMemoryCache::new(), 3)
}

async fn started_worker(connector: &InMemoryConnector, config: ConsumerConfig) -> ConsumerWorker {
    let mut worker = ConsumerWorker::new(
        config,
        Arc::new(connector.clone()),
        Arc::new(JsonMessageProcessor::default()),
    );
    worker.setup().await.expect("setup");
    assert!(worker.is_connected());
    worker
}

fn dyn_shards(connector: &InMemoryConnector) -> Vec<Arc<dyn LockShard>> {
    connector
        .lock_shards()
        .iter()
        .map(|s| Arc::clone(s) as Arc<dyn LockShard>)
        .collect()
}

fn entry(cache: &InMemoryCache, key: &str) -> CacheEntry {
    let raw = cache.snapshot(key).expect("entry present");
    serde_json::from_str(&raw).expect("entry decodes")
}

#[tokio::test]
async fn test_order_42_is_written_released_and_acked() {
    let connector = connector();
    let mut worker = started_worker(&connector, config(3)).await;
    assert!(connector.cache().snapshot("order-42").is_none());

    connector.broker().publish(
        "router",
        "",
        r#"{"sm_seq": "order-42", "status": "paid", "amount": 1250}"#,
    );
    let report = worker.run_cycle().await;

    assert_eq!(
        report.outcome,
        CycleOutcome::Acked {
            key: "order-42".to_string(),
            written: true
        }
    );
    let stored = entry(connector.cache(), "order-42");
    assert_eq!(stored.payload["status"], "paid");
    assert_eq!(stored.payload["amount"], 1250);
    assert_eq!(stored.revision, 1);

    assert_eq!(connector.broker().acked().len(), 1);
    assert_eq!(connector.broker().unacked_len(), 0);
    assert_eq!(connector.broker().queue_len("msgs"), 0);
    for shard in connector.lock_shards() {
        assert_eq!(shard.holder("order-42.lock"), None);
    }
}

#[tokio::test]
async fn test_no_write_when_lock_is_not_acquired() {
    let connector = connector();
    let mut worker = started_worker(&connector, config(2)).await;

    connector.lock_shards()[0].set_reachable(false);
    connector.lock_shards()[1].set_reachable(false);
    connector
        .broker()
        .publish("router", "", r#"{"sm_seq": "order-42", "status": "paid"}"#);

    let report = worker.run_cycle().await;
    assert!(matches!(report.outcome, CycleOutcome::Requeued { .. }));
    assert_eq!(connector.cache().write_count(), 0);
    assert!(connector.cache().snapshot("order-42").is_none());
    assert!(connector.broker().acked().is_empty());
    assert_eq!(connector.broker().queue_len("msgs"), 1);
}

#[tokio::test]
async fn test_minority_partition_does_not_block_processing() {
    let connector = connector();
    let mut worker = started_worker(&connector, config(3)).await;

    connector.lock_shards()[2].set_reachable(false);
    connector
        .broker()
        .publish("router", "", r#"{"sm_seq": "order-42"}"#);

    let report = worker.run_cycle().await;
    assert!(matches!(report.outcome, CycleOutcome::Acked { .. }));
}

#[tokio::test]
async fn test_ack_only_after_commit() {
    let connector = connector();
    let mut worker = started_worker(&connector, config(3)).await;

    connector.cache().fail_writes(true);
    connector
        .broker()
        .publish("router", "", r#"{"sm_seq": "order-42", "status": "paid"}"#);

    let report = worker.run_cycle().await;
    assert!(matches!(report.outcome, CycleOutcome::Requeued { .. }));
    assert!(connector.broker().acked().is_empty());
    assert_eq!(connector.cache().write_count(), 0);
    for shard in connector.lock_shards() {
        assert_eq!(shard.holder("order-42.lock"), None);
    }

    connector.cache().fail_writes(false);
    let report = worker.run_cycle().await;
    assert!(matches!(
        report.outcome,
        CycleOutcome::Acked { written: true, .. }
    ));
    assert_eq!(connector.broker().acked().len(), 1);
    assert_eq!(connector.cache().write_count(), 1);
    assert_eq!(connector.broker().redeliveries(), 1);
}

#[tokio::test]
async fn test_poison_message_is_never_retried() {
    let connector = connector();
    let mut worker = started_worker(&connector, config(3)).await;

    connector.broker().publish("router", "", "");
    connector.broker().publish("router", "", "{not json");
    connector
        .broker()
        .publish("router", "", r#"{"status": "no key"}"#);

    let mut results = PollResults::default();
    for _ in 0..5 {
        let report = worker.run_cycle().await;
        results.record(&report);
    }

    assert_eq!(results.dropped, 3);
    assert_eq!(results.idle, 2);
    assert_eq!(connector.broker().dead_lettered().len(), 3);
    assert_eq!(connector.broker().redeliveries(), 0);
    assert_eq!(connector.cache().write_count(), 0);
}

#[tokio::test]
async fn test_abandoned_lock_heals_after_ttl() {
    let connector = connector();
    let mut worker = started_worker(&connector, config(1)).await;

    // A crashed holder took the lock and never released it.
    let crashed = LockCoordinator::new(dyn_shards(&connector)).expect("odd shard count");
    let ttl = Duration::from_millis(150);
    let _abandoned = crashed
        .acquire("order-42.lock", ttl)
        .await
        .expect("free resource");

    connector
        .broker()
        .publish("router", "", r#"{"sm_seq": "order-42"}"#);
    let report = worker.run_cycle().await;
    assert!(matches!(report.outcome, CycleOutcome::Requeued { .. }));

    tokio::time::sleep(ttl + crashed.drift_margin(ttl)).await;
    let report = worker.run_cycle().await;
    assert!(matches!(report.outcome, CycleOutcome::Acked { .. }));
}

#[tokio::test]
async fn test_broker_outage_and_reconnect() {
    let connector = connector();
    let mut worker = started_worker(&connector, config(3)).await;

    connector
        .broker()
        .publish("router", "", r#"{"sm_seq": "order-1"}"#);
    connector.broker().set_available(false);

    let report = worker.run_cycle().await;
    assert!(matches!(report.outcome, CycleOutcome::Disconnected { .. }));
    assert!(!worker.is_connected());
    assert_eq!(connector.broker().queue_len("msgs"), 1);

    connector.broker().set_available(true);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let report = worker.run_cycle().await;
    assert!(matches!(report.outcome, CycleOutcome::Acked { .. }));
    assert!(worker.is_connected());
    assert_eq!(connector.broker().acked().len(), 1);
}

#[tokio::test]
async fn test_updates_bump_revision_and_duplicates_do_not() {
    let connector = connector();
    let mut worker = started_worker(&connector, config(3).with_max_messages_per_poll(10)).await;

    for body in [
        r#"{"sm_seq": "order-42", "status": "created"}"#,
        r#"{"sm_seq": "order-42", "status": "paid"}"#,
        r#"{"status": "paid", "sm_seq": "order-42"}"#,
    ] {
        connector.broker().publish("router", "", body);
    }

    let mut results = PollResults::default();
    worker.poll(&mut results).await;
    assert_eq!(results.acked, 3);
    assert_eq!(connector.cache().write_count(), 2);

    let stored = entry(connector.cache(), "order-42");
    assert_eq!(stored.revision, 2);
    assert_eq!(stored.payload["status"], "paid");
}

#[tokio::test]
async fn test_pool_drains_queue() {
    let connector = connector();
    let config = config(5).with_max_messages_per_poll(4);

    // Declare the topology before publishing.
    let mut bootstrap = started_worker(&connector, config.clone()).await;
    bootstrap.teardown().await;

    for i in 0..12 {
        connector
            .broker()
            .publish("router", "", format!(r#"{{"sm_seq": "order-{i}"}}"#));
    }

    let shared = connector.clone();
    let mut pool = WorkerPool::new(
        WorkerPoolConfig::new(3)
            .with_cycle_timeout(Duration::from_secs(5))
            .with_loop_interval(Duration::from_millis(5)),
        move |i| {
            ConsumerWorker::new(
                config.clone(),
                Arc::new(shared.clone()),
                Arc::new(JsonMessageProcessor::default()),
            )
            .with_id(format!("test-{i}"))
        },
    );
    pool.start().expect("start");

    for _ in 0..200 {
        if connector.broker().acked().len() == 12 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    pool.shutdown().await.expect("shutdown");

    assert_eq!(connector.broker().acked().len(), 12);
    assert_eq!(connector.cache().write_count(), 12);
    let acked: u64 = pool.last_results().values().map(|r| r.acked).sum();
    assert_eq!(acked, 12);
}
