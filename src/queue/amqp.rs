//! AMQP 0.9.1 consumer built on lapin.
//!
//! One connection and one channel per session. The channel's prefetch is set
//! to the worker batch size so the broker never pushes more unacknowledged
//! deliveries than a single poll can settle.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tracing::{debug, info, warn};

use super::{DeliveryHandle, QueueClient, QueueMessage, Topology};
use crate::config::BrokerConfig;
use crate::error::QueueError;

/// Broker session over AMQP.
pub struct AmqpQueue {
    connection: Connection,
    channel: Channel,
    consumer_tag: String,
    topology: Option<Topology>,
    consumer: Option<Consumer>,
    /// Delivery tags handed out by `wait_one` and not yet settled.
    outstanding: HashSet<u64>,
}

impl AmqpQueue {
    /// Connects to the broker and opens a channel.
    ///
    /// # Arguments
    ///
    /// * `config` - Broker endpoint, credentials, vhost and consumer tag
    /// * `prefetch` - Maximum unacknowledged deliveries pushed to this session
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Connection` if the broker cannot be reached or
    /// rejects the credentials.
    pub async fn connect(config: &BrokerConfig, prefetch: u16) -> Result<Self, QueueError> {
        let connection = Connection::connect(&config.amqp_uri(), ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        channel
            .basic_qos(prefetch.max(1), BasicQosOptions::default())
            .await?;

        info!(
            host = %config.host,
            port = config.port,
            vhost = %config.vhost,
            "Connected to AMQP broker"
        );

        Ok(Self {
            connection,
            channel,
            consumer_tag: config.consumer_tag.clone(),
            topology: None,
            consumer: None,
            outstanding: HashSet::new(),
        })
    }

    fn check_outstanding(&self, handle: &DeliveryHandle) -> Result<(), QueueError> {
        if !self.outstanding.contains(&handle.tag()) {
            return Err(QueueError::Protocol(format!(
                "delivery {} is not outstanding on this session",
                handle.tag()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueClient for AmqpQueue {
    async fn declare_topology(&mut self, topology: &Topology) -> Result<(), QueueError> {
        self.channel
            .exchange_declare(
                &topology.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        self.channel
            .queue_declare(
                &topology.queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        self.channel
            .queue_bind(
                &topology.queue,
                &topology.exchange,
                &topology.binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        debug!(
            exchange = %topology.exchange,
            queue = %topology.queue,
            binding_key = %topology.binding_key,
            "Declared topology"
        );
        self.topology = Some(topology.clone());
        Ok(())
    }

    async fn consume(&mut self) -> Result<(), QueueError> {
        let queue = match &self.topology {
            Some(t) => t.queue.clone(),
            None => {
                return Err(QueueError::Protocol(
                    "consume called before declare_topology".to_string(),
                ))
            }
        };

        let consumer = self
            .channel
            .basic_consume(
                &queue,
                &self.consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn wait_one(&mut self, timeout: Duration) -> Result<Option<QueueMessage>, QueueError> {
        let consumer = self.consumer.as_mut().ok_or_else(|| {
            QueueError::Protocol("wait_one called before consume".to_string())
        })?;

        let next = tokio::time::timeout(timeout, consumer.next()).await;
        match next {
            Err(_) => Ok(None),
            Ok(None) => Err(QueueError::Connection(
                "consumer stream closed by broker".to_string(),
            )),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(Some(Ok(delivery))) => {
                self.outstanding.insert(delivery.delivery_tag);
                Ok(Some(QueueMessage {
                    handle: DeliveryHandle::new(delivery.delivery_tag),
                    redelivered: delivery.redelivered,
                    body: delivery.data,
                }))
            }
        }
    }

    async fn ack(&mut self, handle: &DeliveryHandle) -> Result<(), QueueError> {
        self.check_outstanding(handle)?;
        self.channel
            .basic_ack(handle.tag(), BasicAckOptions::default())
            .await?;
        self.outstanding.remove(&handle.tag());
        Ok(())
    }

    async fn reject(&mut self, handle: &DeliveryHandle, requeue: bool) -> Result<(), QueueError> {
        self.check_outstanding(handle)?;
        self.channel
            .basic_reject(handle.tag(), BasicRejectOptions { requeue })
            .await?;
        self.outstanding.remove(&handle.tag());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        self.consumer = None;
        self.outstanding.clear();
        if let Err(e) = self.channel.close(200, "consumer shutdown").await {
            warn!(error = %e, "Failed to close AMQP channel cleanly");
        }
        self.connection.close(200, "consumer shutdown").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires a RabbitMQ broker on localhost:5672
    async fn test_live_broker_round_trip() {
        let config = BrokerConfig {
            queue: "quorum-consumer-test".to_string(),
            ..BrokerConfig::default()
        };
        let mut queue = AmqpQueue::connect(&config, 1)
            .await
            .expect("broker on localhost:5672");
        queue
            .declare_topology(&Topology::from(&config))
            .await
            .expect("declare");
        queue.consume().await.expect("consume");

        // Nothing published: the wait must end on its own.
        let message = queue
            .wait_one(Duration::from_millis(200))
            .await
            .expect("no error");
        if let Some(message) = message {
            queue.reject(&message.handle, true).await.expect("reject");
        }
        queue.close().await.expect("close");
    }
}
