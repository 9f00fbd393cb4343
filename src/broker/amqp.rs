//! AMQP (RabbitMQ) broker session.
//!
//! One lapin connection with exactly one channel. Every capability call goes
//! through that channel; nothing here reconnects.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeBindOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, info, warn};

use super::{
    BrokerError, BrokerSession, Consumer, DeliveryStream, Dialer, Publisher, Publishing,
    Registerer, Result,
};

/// Reply code for a normal AMQP close.
const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ with lapin.
#[derive(Debug, Clone, Default)]
pub struct AmqpDialer;

#[async_trait]
impl Dialer for AmqpDialer {
    async fn dial(&self, uri: &str) -> Result<Arc<dyn BrokerSession>> {
        let session = AmqpSession::connect(uri).await?;
        Ok(Arc::new(session) as Arc<dyn BrokerSession>)
    }
}

/// A live AMQP connection and its single channel.
pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

impl AmqpSession {
    /// Connect to `uri` and open the session channel.
    pub async fn connect(uri: &str) -> Result<Self> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to connect: {}", e)))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(REPLY_SUCCESS, "channel open failed").await;
                return Err(BrokerError::Connection(format!(
                    "Failed to create channel: {}",
                    e
                )));
            }
        };

        debug!(channel_id = channel.id(), "Opened AMQP channel");

        Ok(Self {
            connection,
            channel,
        })
    }

    /// The underlying channel, for operations the capability traits don't cover.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

#[async_trait]
impl Publisher for AmqpSession {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        message: Publishing,
    ) -> Result<()> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                options,
                &message.body,
                message.properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to publish: {}", e)))?;

        confirm
            .await
            .map_err(|e| BrokerError::Publish(format!("Publish confirmation failed: {}", e)))?;

        debug!(
            exchange = %exchange,
            routing_key = %routing_key,
            "Published message"
        );
        Ok(())
    }
}

#[async_trait]
impl Consumer for AmqpSession {
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        args: FieldTable,
    ) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, options, args)
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to start consumer: {}", e)))?;

        info!(queue = %queue, consumer_tag = %consumer_tag, "Consumer started");

        Ok(consumer
            .map(|delivery| {
                delivery.map_err(|e| BrokerError::Consume(format!("Delivery failed: {}", e)))
            })
            .boxed())
    }
}

#[async_trait]
impl Registerer for AmqpSession {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<()> {
        self.channel
            .exchange_declare(name, kind, options, args)
            .await
            .map_err(|e| {
                BrokerError::Declare(format!("Failed to declare exchange {}: {}", name, e))
            })
    }

    async fn exchange_bind(
        &self,
        destination: &str,
        routing_key: &str,
        source: &str,
        options: ExchangeBindOptions,
        args: FieldTable,
    ) -> Result<()> {
        self.channel
            .exchange_bind(destination, source, routing_key, options, args)
            .await
            .map_err(|e| {
                BrokerError::Declare(format!(
                    "Failed to bind exchange {} to {}: {}",
                    destination, source, e
                ))
            })
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<()> {
        self.channel
            .queue_declare(name, options, args)
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Declare(format!("Failed to declare queue {}: {}", name, e)))
    }

    async fn queue_bind(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
        options: QueueBindOptions,
        args: FieldTable,
    ) -> Result<()> {
        self.channel
            .queue_bind(queue, exchange, routing_key, options, args)
            .await
            .map_err(|e| {
                BrokerError::Declare(format!(
                    "Failed to bind queue {} to {}: {}",
                    queue, exchange, e
                ))
            })
    }
}

#[async_trait]
impl BrokerSession for AmqpSession {
    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(REPLY_SUCCESS, "OK").await {
                warn!(error = %e, "Failed to close AMQP channel");
            }
        }

        if !self.connection.status().connected() {
            return Ok(());
        }

        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| BrokerError::Close(e.to_string()))
    }
}
