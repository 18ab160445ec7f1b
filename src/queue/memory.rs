//! Process-local broker with AMQP-like delivery semantics.
//!
//! Several `InMemoryQueue` sessions can share one `InMemoryBroker`, which makes
//! it possible to run competing workers against the same queue in tests.
//! Unsettled deliveries go back to the head of their queue, flagged as
//! redelivered, when the owning session closes, is dropped, or loses its
//! connection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{DeliveryHandle, QueueClient, QueueMessage, Topology};
use crate::error::QueueError;

#[derive(Debug)]
struct Pending {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    body: Vec<u8>,
    session: u64,
}

#[derive(Debug, Default)]
struct BrokerState {
    available: bool,
    /// Bumped on every outage; sessions from an older epoch are dead.
    epoch: u64,
    /// exchange -> (binding key, queue)
    exchanges: HashMap<String, Vec<(String, String)>>,
    queues: HashMap<String, VecDeque<Pending>>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    next_session: u64,
    acked: Vec<Vec<u8>>,
    dead_lettered: Vec<Vec<u8>>,
    redeliveries: u64,
}

impl BrokerState {
    fn requeue_session(&mut self, session: Option<u64>) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| session.map_or(true, |s| u.session == s))
            .map(|(tag, _)| *tag)
            .collect();
        // Highest tag first so the oldest delivery ends up at the head.
        let mut tags = tags;
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(entry) = self.unacked.remove(&tag) {
                self.redeliveries += 1;
                self.queues
                    .entry(entry.queue)
                    .or_default()
                    .push_front(Pending {
                        body: entry.body,
                        redelivered: true,
                    });
            }
        }
    }
}

/// Shared in-memory broker.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                available: true,
                ..BrokerState::default()
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // A panic while holding the lock cannot leave the maps half-updated in
        // a way that matters to a test double, so recover the guard.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Opens a new session.
    pub fn connect(&self) -> Result<InMemoryQueue, QueueError> {
        let mut state = self.state();
        if !state.available {
            return Err(QueueError::Connection("broker unavailable".to_string()));
        }
        state.next_session += 1;
        Ok(InMemoryQueue {
            broker: self.clone(),
            session: state.next_session,
            epoch: state.epoch,
            topology: None,
            consuming: false,
            outstanding: HashSet::new(),
            closed: false,
        })
    }

    /// Routes a message through a direct exchange. Returns how many queues
    /// received it.
    pub fn publish(&self, exchange: &str, routing_key: &str, body: impl Into<Vec<u8>>) -> usize {
        let body = body.into();
        let mut state = self.state();
        let targets: Vec<String> = state
            .exchanges
            .get(exchange)
            .map(|bindings| {
                bindings
                    .iter()
                    .filter(|(key, _)| key == routing_key)
                    .map(|(_, queue)| queue.clone())
                    .collect()
            })
            .unwrap_or_default();
        for queue in &targets {
            state.queues.entry(queue.clone()).or_default().push_back(Pending {
                body: body.clone(),
                redelivered: false,
            });
        }
        drop(state);
        self.notify.notify_waiters();
        targets.len()
    }

    /// Simulates a broker outage (`false`) or recovery (`true`). An outage
    /// kills every open session and returns their unsettled deliveries.
    pub fn set_available(&self, available: bool) {
        let mut state = self.state();
        if state.available && !available {
            state.epoch += 1;
            state.requeue_session(None);
        }
        state.available = available;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Number of messages ready for delivery on `queue`.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Number of delivered but unsettled messages.
    pub fn unacked_len(&self) -> usize {
        self.state().unacked.len()
    }

    /// Bodies of acknowledged messages, in settlement order.
    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.state().acked.clone()
    }

    /// Bodies of messages rejected without requeue.
    pub fn dead_lettered(&self) -> Vec<Vec<u8>> {
        self.state().dead_lettered.clone()
    }

    /// Total number of times a message went back on a queue.
    pub fn redeliveries(&self) -> u64 {
        self.state().redeliveries
    }
}

/// One session against an `InMemoryBroker`.
#[derive(Debug)]
pub struct InMemoryQueue {
    broker: InMemoryBroker,
    session: u64,
    epoch: u64,
    topology: Option<Topology>,
    consuming: bool,
    /// Delivery tags handed out by `wait_one` and not yet settled.
    outstanding: HashSet<u64>,
    closed: bool,
}

impl InMemoryQueue {
    fn live_state(&self) -> Result<MutexGuard<'_, BrokerState>, QueueError> {
        let state = self.broker.state();
        if self.closed {
            return Err(QueueError::Protocol("session is closed".to_string()));
        }
        if !state.available || state.epoch != self.epoch {
            return Err(QueueError::Connection("connection lost".to_string()));
        }
        Ok(state)
    }

    fn try_take(&mut self) -> Result<Option<QueueMessage>, QueueError> {
        let queue = match &self.topology {
            Some(t) => t.queue.clone(),
            None => return Err(QueueError::Protocol("topology not declared".to_string())),
        };
        let session = self.session;
        let mut state = self.live_state()?;
        let Some(pending) = state.queues.get_mut(&queue).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        state.next_tag += 1;
        let tag = state.next_tag;
        state.unacked.insert(
            tag,
            Unacked {
                queue,
                body: pending.body.clone(),
                session,
            },
        );
        drop(state);
        self.outstanding.insert(tag);
        Ok(Some(QueueMessage {
            body: pending.body,
            handle: DeliveryHandle::new(tag),
            redelivered: pending.redelivered,
        }))
    }

    fn settle(&mut self, handle: &DeliveryHandle, outcome: Settlement) -> Result<(), QueueError> {
        let tag = handle.tag();
        if !self.outstanding.contains(&tag) {
            return Err(QueueError::Protocol(format!(
                "delivery {tag} is not outstanding on this session"
            )));
        }
        let session = self.session;
        let mut state = self.live_state()?;
        let owned = state
            .unacked
            .get(&tag)
            .is_some_and(|entry| entry.session == session);
        let entry = if owned { state.unacked.remove(&tag) } else { None };
        let Some(entry) = entry else {
            return Err(QueueError::Protocol(format!(
                "unknown delivery tag {tag} for this session"
            )));
        };
        match outcome {
            Settlement::Ack => state.acked.push(entry.body),
            Settlement::Reject { requeue: true } => {
                state.redeliveries += 1;
                state.queues.entry(entry.queue).or_default().push_front(Pending {
                    body: entry.body,
                    redelivered: true,
                });
            }
            Settlement::Reject { requeue: false } => state.dead_lettered.push(entry.body),
        }
        drop(state);
        self.outstanding.remove(&tag);
        self.broker.notify.notify_waiters();
        Ok(())
    }

    fn release_unsettled(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.outstanding.clear();
        let mut state = self.broker.state();
        if state.epoch == self.epoch {
            state.requeue_session(Some(self.session));
        }
        drop(state);
        self.broker.notify.notify_waiters();
    }
}

enum Settlement {
    Ack,
    Reject { requeue: bool },
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn declare_topology(&mut self, topology: &Topology) -> Result<(), QueueError> {
        let mut state = self.live_state()?;
        state.queues.entry(topology.queue.clone()).or_default();
        let bindings = state.exchanges.entry(topology.exchange.clone()).or_default();
        let binding = (topology.binding_key.clone(), topology.queue.clone());
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        drop(state);
        self.topology = Some(topology.clone());
        Ok(())
    }

    async fn consume(&mut self) -> Result<(), QueueError> {
        if self.topology.is_none() {
            return Err(QueueError::Protocol(
                "consume called before declare_topology".to_string(),
            ));
        }
        drop(self.live_state()?);
        self.consuming = true;
        Ok(())
    }

    async fn wait_one(&mut self, timeout: Duration) -> Result<Option<QueueMessage>, QueueError> {
        if !self.consuming {
            return Err(QueueError::Protocol(
                "wait_one called before consume".to_string(),
            ));
        }
        let deadline = Instant::now() + timeout;
        let notify = Arc::clone(&self.broker.notify);
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_take()? {
                return Ok(Some(message));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, handle: &DeliveryHandle) -> Result<(), QueueError> {
        self.settle(handle, Settlement::Ack)
    }

    async fn reject(&mut self, handle: &DeliveryHandle, requeue: bool) -> Result<(), QueueError> {
        self.settle(handle, Settlement::Reject { requeue })
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        self.release_unsettled();
        Ok(())
    }
}

impl Drop for InMemoryQueue {
    fn drop(&mut self) {
        self.release_unsettled();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn consuming_session(broker: &InMemoryBroker) -> InMemoryQueue {
        let mut session = broker.connect().expect("broker available");
        session
            .declare_topology(&Topology::new("router", "msgs", ""))
            .await
            .expect("declare");
        session.consume().await.expect("consume");
        session
    }

    #[tokio::test]
    async fn test_publish_routes_by_binding_key() {
        let broker = InMemoryBroker::new();
        let _session = consuming_session(&broker).await;

        assert_eq!(broker.publish("router", "", "a"), 1);
        assert_eq!(broker.publish("router", "other", "b"), 0);
        assert_eq!(broker.publish("missing", "", "c"), 0);
        assert_eq!(broker.queue_len("msgs"), 1);
    }

    #[tokio::test]
    async fn test_declare_topology_is_idempotent() {
        let broker = InMemoryBroker::new();
        let mut session = consuming_session(&broker).await;
        session
            .declare_topology(&Topology::new("router", "msgs", ""))
            .await
            .expect("second declare");

        // A duplicated binding would route the message twice.
        assert_eq!(broker.publish("router", "", "a"), 1);
    }

    #[tokio::test]
    async fn test_wait_one_times_out_when_empty() {
        let broker = InMemoryBroker::new();
        let mut session = consuming_session(&broker).await;

        let started = Instant::now();
        let message = session
            .wait_one(Duration::from_millis(30))
            .await
            .expect("no error");
        assert!(message.is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_wait_one_wakes_on_publish() {
        let broker = InMemoryBroker::new();
        let mut session = consuming_session(&broker).await;

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("router", "", "late");
        });

        let message = session
            .wait_one(Duration::from_secs(2))
            .await
            .expect("no error")
            .expect("message delivered");
        assert_eq!(message.body, b"late");
        assert!(!message.redelivered);
    }

    #[tokio::test]
    async fn test_wait_one_before_consume_is_protocol_error() {
        let broker = InMemoryBroker::new();
        let mut session = broker.connect().expect("connect");
        let err = session
            .wait_one(Duration::from_millis(1))
            .await
            .expect_err("must fail");
        assert!(matches!(err, QueueError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_double_ack_is_protocol_error() {
        let broker = InMemoryBroker::new();
        let mut session = consuming_session(&broker).await;
        broker.publish("router", "", "a");

        let message = session
            .wait_one(Duration::from_secs(1))
            .await
            .expect("no error")
            .expect("delivered");
        session.ack(&message.handle).await.expect("first ack");

        let err = session.ack(&message.handle).await.expect_err("second ack");
        assert!(matches!(err, QueueError::Protocol(_)));
        let err = session
            .reject(&message.handle, true)
            .await
            .expect_err("reject after ack");
        assert!(matches!(err, QueueError::Protocol(_)));
        assert_eq!(broker.acked().len(), 1);
    }

    #[tokio::test]
    async fn test_settled_tags_are_forgotten() {
        let broker = InMemoryBroker::new();
        let mut session = consuming_session(&broker).await;

        for i in 0..1000 {
            broker.publish("router", "", format!("m-{i}"));
            let message = session
                .wait_one(Duration::from_secs(1))
                .await
                .expect("no error")
                .expect("delivered");
            assert_eq!(session.outstanding.len(), 1);
            if i % 2 == 0 {
                session.ack(&message.handle).await.expect("ack");
            } else {
                session.reject(&message.handle, false).await.expect("reject");
            }
        }

        assert!(session.outstanding.is_empty());
        assert_eq!(broker.acked().len(), 500);
        assert_eq!(broker.dead_lettered().len(), 500);
    }

    #[tokio::test]
    async fn test_settle_of_foreign_tag_is_protocol_error() {
        let broker = InMemoryBroker::new();
        let mut owner = consuming_session(&broker).await;
        let mut other = consuming_session(&broker).await;
        broker.publish("router", "", "a");

        let message = owner
            .wait_one(Duration::from_secs(1))
            .await
            .expect("no error")
            .expect("delivered");
        let err = other.ack(&message.handle).await.expect_err("not ours");
        assert!(matches!(err, QueueError::Protocol(_)));
        owner.ack(&message.handle).await.expect("owner ack");
    }

    #[tokio::test]
    async fn test_reject_with_requeue_redelivers() {
        let broker = InMemoryBroker::new();
        let mut session = consuming_session(&broker).await;
        broker.publish("router", "", "a");

        let first = session
            .wait_one(Duration::from_secs(1))
            .await
            .expect("no error")
            .expect("delivered");
        session.reject(&first.handle, true).await.expect("reject");

        let second = session
            .wait_one(Duration::from_secs(1))
            .await
            .expect("no error")
            .expect("redelivered");
        assert_eq!(second.body, b"a");
        assert!(second.redelivered);
        assert_ne!(first.handle, second.handle);
    }

    #[tokio::test]
    async fn test_reject_without_requeue_dead_letters() {
        let broker = InMemoryBroker::new();
        let mut session = consuming_session(&broker).await;
        broker.publish("router", "", "poison");

        let message = session
            .wait_one(Duration::from_secs(1))
            .await
            .expect("no error")
            .expect("delivered");
        session.reject(&message.handle, false).await.expect("reject");

        assert_eq!(broker.queue_len("msgs"), 0);
        assert_eq!(broker.dead_lettered(), vec![b"poison".to_vec()]);
    }

    #[tokio::test]
    async fn test_dropped_session_returns_unsettled_messages() {
        let broker = InMemoryBroker::new();
        let mut session = consuming_session(&broker).await;
        broker.publish("router", "", "a");

        let _message = session
            .wait_one(Duration::from_secs(1))
            .await
            .expect("no error")
            .expect("delivered");
        assert_eq!(broker.unacked_len(), 1);

        drop(session);
        assert_eq!(broker.unacked_len(), 0);
        assert_eq!(broker.queue_len("msgs"), 1);
    }

    #[tokio::test]
    async fn test_outage_kills_sessions() {
        let broker = InMemoryBroker::new();
        let mut session = consuming_session(&broker).await;
        broker.publish("router", "", "a");
        let message = session
            .wait_one(Duration::from_secs(1))
            .await
            .expect("no error")
            .expect("delivered");

        broker.set_available(false);
        let err = session.ack(&message.handle).await.expect_err("lost");
        assert!(matches!(err, QueueError::Connection(_)));
        assert!(broker.connect().is_err());

        broker.set_available(true);
        let err = session
            .wait_one(Duration::from_millis(1))
            .await
            .expect_err("stale session");
        assert!(matches!(err, QueueError::Connection(_)));
        assert_eq!(broker.queue_len("msgs"), 1);
    }
}
