//! RabbitMQ broker over AMQP 0-9-1
//!
//! Publishes with publisher confirms to a topic exchange; subscriber queues
//! are declared (durable by default) and consumed with manual acks.

mod config;

pub use config::AmqpConfig;

use super::{Broker, BrokerChannel, Delivery, DeliveryStream};
use crate::error::{EiffelError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::Arc;
use tokio::sync::watch;

/// AMQP delivery mode for messages that survive a broker restart
const PERSISTENT: u8 = 2;

/// RabbitMQ broker
pub struct AmqpBroker {
    config: AmqpConfig,
}

impl AmqpBroker {
    /// Create a broker handle; no connection is made until `connect`
    pub fn new(config: AmqpConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AmqpConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>> {
        let endpoint = self.endpoint();
        let connection = tokio::time::timeout(
            self.config.connect_timeout(),
            Connection::connect(&self.config.uri(), ConnectionProperties::default()),
        )
        .await
        .map_err(|_| EiffelError::Connection(format!("{endpoint}: connect timed out")))?
        .map_err(|e| EiffelError::Connection(format!("{endpoint}: {e}")))?;

        let (lost_tx, lost) = watch::channel(false);
        connection.on_error(move |e| {
            tracing::warn!(error = %e, "RabbitMQ connection failed");
            lost_tx.send_replace(true);
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| EiffelError::Connection(format!("Failed to create channel: {e}")))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| EiffelError::Connection(format!("Failed to enable confirms: {e}")))?;

        channel
            .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| EiffelError::Connection(format!("Failed to set prefetch: {e}")))?;

        if self.config.declare_exchange {
            channel
                .exchange_declare(
                    &self.config.exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    EiffelError::Connection(format!("Failed to declare exchange: {e}"))
                })?;
        }

        tracing::info!(
            endpoint = %endpoint,
            vhost = %self.config.vhost,
            exchange = %self.config.exchange,
            "Connected to RabbitMQ"
        );

        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
            lost,
            exchange: self.config.exchange.clone(),
            queue_durable: self.config.queue_durable,
        }))
    }

    fn name(&self) -> &str {
        "amqp"
    }
}

struct AmqpChannel {
    connection: Connection,
    channel: Channel,

    /// Set by the connection's error callback
    lost: watch::Receiver<bool>,
    exchange: String,
    queue_durable: bool,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<()> {
        let publish_err = |reason: String| EiffelError::Publish {
            routing_key: routing_key.to_string(),
            reason,
        };

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT);

        let confirmation = self
            .channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| publish_err(e.to_string()))?
            .await
            .map_err(|e| publish_err(format!("confirm failed: {e}")))?;

        if confirmation.is_nack() {
            return Err(publish_err("broker rejected the message".to_string()));
        }
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: self.queue_durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| EiffelError::Subscribe {
                pattern: queue.to_string(),
                reason: format!("Failed to declare queue: {e}"),
            })?;
        Ok(())
    }

    async fn bind(&self, queue: &str, binding_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                &self.exchange,
                binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| EiffelError::Subscribe {
                pattern: binding_key.to_string(),
                reason: format!("Failed to bind queue '{queue}': {e}"),
            })
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let consumer_tag = format!("eiffel-event-{}", uuid::Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| EiffelError::Subscribe {
                pattern: queue.to_string(),
                reason: format!("Failed to start consumer: {e}"),
            })?;

        let stream = consumer.map(|item| match item {
            Ok(delivery) => Ok(into_delivery(delivery)),
            Err(e) => Err(EiffelError::Connection(format!("Consumer error: {e}"))),
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel
                .close(200, "closing")
                .await
                .map_err(|e| EiffelError::Connection(format!("Failed to close channel: {e}")))?;
        }
        if self.connection.status().connected() {
            self.connection
                .close(200, "closing")
                .await
                .map_err(|e| {
                    EiffelError::Connection(format!("Failed to close connection: {e}"))
                })?;
        }
        Ok(())
    }

    async fn closed(&self) {
        let mut lost = self.lost.clone();
        let _ = lost.wait_for(|lost| *lost).await;
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let lapin::message::Delivery {
        routing_key,
        redelivered,
        data,
        acker,
        ..
    } = delivery;
    let nack_acker = acker.clone();

    Delivery::new(
        routing_key.as_str(),
        data,
        redelivered,
        move || {
            Box::pin(async move {
                acker
                    .ack(BasicAckOptions::default())
                    .await
                    .map_err(|e| EiffelError::Ack(e.to_string()))
            })
        },
        move |requeue| {
            Box::pin(async move {
                nack_acker
                    .nack(BasicNackOptions {
                        requeue,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| EiffelError::Ack(e.to_string()))
            })
        },
    )
}
