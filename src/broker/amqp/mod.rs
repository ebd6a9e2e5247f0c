//! AMQP (RabbitMQ) broker adapter.
//!
//! Thin mapping from the broker traits onto a lapin connection and channel.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, info};

use super::{
    Acknowledger, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, ExchangeOptions,
    QueueOptions,
};
use crate::envelope::Envelope;
use crate::error::{EventsError, Result};

/// Queue argument naming the dead-letter exchange.
const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// Reply code for a normal channel or connection close.
const REPLY_SUCCESS: u16 = 200;

fn broker_error(context: &str, e: lapin::Error) -> EventsError {
    EventsError::Broker(format!("{}: {}", context, e))
}

/// AMQP connection opened from a URI (e.g., amqp://localhost:5672).
pub struct AmqpConnection {
    connection: Connection,
}

impl AmqpConnection {
    pub async fn connect(uri: &str) -> Result<Self> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| broker_error("Failed to connect", e))?;

        info!("Connected to AMQP");
        Ok(Self { connection })
    }

    /// Wrap a connection opened elsewhere.
    pub fn from_connection(connection: Connection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| broker_error("Failed to create channel", e))?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|e| broker_error("Failed to close connection", e))
    }
}

/// Channel on an [`AmqpConnection`].
pub struct AmqpChannel {
    channel: Channel,
}

impl AmqpChannel {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

fn queue_arguments(options: &QueueOptions) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(exchange) = &options.dead_letter_exchange {
        arguments.insert(
            DEAD_LETTER_EXCHANGE_ARG.into(),
            AMQPValue::LongString(exchange.clone().into()),
        );
    }
    arguments
}

fn to_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let envelope = Envelope {
        routing_key: delivery.routing_key.as_str().to_string(),
        content_type: delivery
            .properties
            .content_type()
            .as_ref()
            .map(|ct| ct.as_str().to_string()),
        timestamp: *delivery.properties.timestamp(),
        body: delivery.data,
    };
    Delivery::new(
        envelope,
        delivery.redelivered,
        Box::new(AmqpAcker {
            acker: delivery.acker,
        }),
    )
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|e| broker_error("Failed to ack message", e))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| broker_error("Failed to reject message", e))
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_topic_exchange(&self, name: &str, options: ExchangeOptions) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: options.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| broker_error("Failed to declare exchange", e))
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    exclusive: options.exclusive,
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                queue_arguments(&options),
            )
            .await
            .map(|_| ())
            .map_err(|e| broker_error("Failed to declare queue", e))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| broker_error("Failed to bind queue", e))
    }

    async fn publish(&self, exchange: &str, envelope: Envelope) -> Result<()> {
        let mut properties = BasicProperties::default();
        if let Some(content_type) = envelope.content_type {
            properties = properties.with_content_type(content_type.into());
        }
        if let Some(timestamp) = envelope.timestamp {
            properties = properties.with_timestamp(timestamp);
        }

        // The returned confirm is dropped: publish completes on hand-off.
        let _confirm = self
            .channel
            .basic_publish(
                exchange,
                &envelope.routing_key,
                BasicPublishOptions::default(),
                &envelope.body,
                properties,
            )
            .await
            .map_err(|e| broker_error("Failed to publish", e))?;

        debug!(
            exchange = %exchange,
            routing_key = %envelope.routing_key,
            "Published envelope"
        );
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| broker_error("Failed to start consumer", e))?;

        let stream = consumer.map(|item| {
            item.map(to_delivery)
                .map_err(|e| broker_error("Consumer delivery error", e))
        });
        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|e| broker_error("Failed to close channel", e))
    }
}
