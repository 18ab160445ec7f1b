//! Message broker access.
//!
//! This module provides the queue side of a worker session:
//!
//! - **QueueClient**: topology declaration, consumption, and settlement
//! - **AmqpQueue**: durable direct-exchange consumer over AMQP 0.9.1
//! - **InMemoryBroker**: process-local broker with the same delivery semantics,
//!   used by tests and local simulations
//!
//! # Delivery semantics
//!
//! Consumption always runs with explicit acknowledgment. A delivered message
//! stays unacknowledged, and redeliverable, until its handle is settled with
//! exactly one of `ack` or `reject`. Settling a handle twice is a protocol
//! error. Connection loss surfaces as `QueueError::Connection`; the client
//! never reconnects on its own.

pub mod amqp;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::config::BrokerConfig;
use crate::error::QueueError;

pub use amqp::AmqpQueue;
pub use memory::{InMemoryBroker, InMemoryQueue};

/// Opaque broker token used only to settle a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryHandle(u64);

impl DeliveryHandle {
    pub(crate) fn new(tag: u64) -> Self {
        Self(tag)
    }

    pub(crate) fn tag(&self) -> u64 {
        self.0
    }
}

/// A message delivered by the broker and not yet settled.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Raw payload bytes.
    pub body: Vec<u8>,
    /// Handle to pass to `ack` or `reject`.
    pub handle: DeliveryHandle,
    /// Set when the broker has delivered this message before.
    pub redelivered: bool,
}

/// Exchange, queue, and the binding between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub binding_key: String,
}

impl Topology {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        binding_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            binding_key: binding_key.into(),
        }
    }
}

impl From<&BrokerConfig> for Topology {
    fn from(config: &BrokerConfig) -> Self {
        Self::new(&config.exchange, &config.queue, &config.binding_key)
    }
}

/// Client side of a broker session.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Idempotently ensures the durable exchange and queue exist and are bound.
    async fn declare_topology(&mut self, topology: &Topology) -> Result<(), QueueError>;

    /// Starts consuming the declared queue with explicit acknowledgment.
    async fn consume(&mut self) -> Result<(), QueueError>;

    /// Waits for exactly one delivery, or `None` once `timeout` elapses.
    async fn wait_one(&mut self, timeout: Duration) -> Result<Option<QueueMessage>, QueueError>;

    /// Acknowledges a delivery. Terminal for the handle.
    async fn ack(&mut self, handle: &DeliveryHandle) -> Result<(), QueueError>;

    /// Rejects a delivery, optionally putting it back on the queue. Terminal
    /// for the handle.
    async fn reject(&mut self, handle: &DeliveryHandle, requeue: bool) -> Result<(), QueueError>;

    /// Closes the session. Unsettled deliveries return to the queue.
    async fn close(&mut self) -> Result<(), QueueError>;
}
