//! RabbitMQ adapter built on `lapin`.

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tracing::debug;

use super::{Acknowledger, Broker, BrokerSession, Deliveries, Delivery, OutboundMessage};
use crate::error::Result;

const PERSISTENT: u8 = 2;

#[derive(Debug, Clone)]
pub struct AmqpBroker {
    uri: String,
}

impl AmqpBroker {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn open(&self) -> Result<Box<dyn BrokerSession>> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        debug!(channel = channel.id(), "opened amqp channel");
        Ok(Box::new(AmqpSession {
            connection,
            channel,
        }))
    }
}

pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    fn is_closed(&self) -> bool {
        !self.connection.status().connected() || !self.channel.status().connected()
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(&self, queue: &str, message: &OutboundMessage) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type(message.content_type.into())
            .with_delivery_mode(PERSISTENT);
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Box<dyn Deliveries>> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(Box::new(AmqpDeliveries { consumer }))
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(200, "closing").await?;
        }
        if self.connection.status().connected() {
            self.connection.close(200, "closing").await?;
        }
        Ok(())
    }
}

struct AmqpDeliveries {
    consumer: Consumer,
}

#[async_trait]
impl Deliveries for AmqpDeliveries {
    async fn next(&mut self) -> Option<Result<Delivery>> {
        let delivery = self.consumer.next().await?;
        Some(
            delivery
                .map(|d| {
                    Delivery::new(
                        d.data,
                        d.redelivered,
                        Box::new(AmqpAcker { acker: d.acker }),
                    )
                })
                .map_err(Into::into),
        )
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }
}
