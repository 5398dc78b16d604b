// src/rabbitmq/amqp_client.rs
//! The broker seam: the supervisor, registrar, producer and consumer only talk
//! to these traits. `RabbitMqClient` is the lapin-backed implementation.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use lapin::{
    acker::Acker,
    message::Delivery,
    options::*,
    types::FieldTable,
    uri::{AMQPScheme, AMQPUri},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::errors::{RabbitMQError, Result};

/// What the broker reported back for a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Per-message AMQP properties set by the producer.
#[derive(Debug, Clone)]
pub struct PublishProperties {
    pub message_id: String,
    pub message_type: String,
    pub timestamp: u64,
    pub persistent: bool,
}

pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery>>;

#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message as handed over by the broker, before any disposition.
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub acker: Box<dyn DeliveryAcker>,
}

impl fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish()
    }
}

#[async_trait]
pub trait AmqpConnector: Send + Sync {
    /// Connection target for logs, with credentials masked.
    fn describe(&self) -> String;

    async fn connect(&self) -> Result<Box<dyn AmqpConnection>>;
}

#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()>;

    async fn confirm_select(&self) -> Result<()>;

    async fn queue_declare(&self, name: &str, durable: bool) -> Result<QueueInfo>;

    /// Publish through the default exchange, routed by queue name.
    async fn basic_publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: PublishProperties,
    ) -> Result<()>;

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn close(&self) -> Result<()>;
}

/// Log label for a broker target. The password never appears.
pub fn describe_uri(uri: &AMQPUri) -> String {
    let scheme = match uri.scheme {
        AMQPScheme::AMQP => "amqp",
        AMQPScheme::AMQPS => "amqps",
    };
    let authority = &uri.authority;
    let username = &authority.userinfo.username;
    if username.is_empty() {
        format!("{}://{}:{} vhost={}", scheme, authority.host, authority.port, uri.vhost)
    } else {
        format!(
            "{}://{}:***@{}:{} vhost={}",
            scheme, username, authority.host, authority.port, uri.vhost
        )
    }
}

pub fn connection_properties(connection_name: &str) -> ConnectionProperties {
    ConnectionProperties::default().with_connection_name(connection_name.to_string().into())
}

pub struct RabbitMqClient {
    amqp_uri: AMQPUri,
    connection_name: String,
    connect_timeout: Duration,
}

impl RabbitMqClient {
    pub fn new(amqp_uri: AMQPUri, connect_timeout: Duration) -> Self {
        Self {
            amqp_uri,
            connection_name: format!("entity-events-{}", &uuid::Uuid::new_v4().to_string()[..8]),
            connect_timeout,
        }
    }
}

#[async_trait]
impl AmqpConnector for RabbitMqClient {
    fn describe(&self) -> String {
        describe_uri(&self.amqp_uri)
    }

    async fn connect(&self) -> Result<Box<dyn AmqpConnection>> {
        let connection = tokio::time::timeout(
            self.connect_timeout,
            Connection::connect_uri(
                self.amqp_uri.clone(),
                connection_properties(&self.connection_name),
            ),
        )
        .await??;

        debug!(connection = %self.connection_name, "lapin connection established");
        Ok(Box::new(LapinConnection(connection)))
    }
}

struct LapinConnection(Connection);

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_connected(&self) -> bool {
        self.0.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        let channel = self
            .0
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))?;
        Ok(Arc::new(LapinChannel(channel)))
    }

    async fn close(&self) -> Result<()> {
        if self.0.status().connected() {
            self.0.close(200, "Closing connection").await?;
        }
        Ok(())
    }
}

struct LapinChannel(Channel);

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.0.status().connected()
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        self.0
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("basic.qos failed: {}", e)))
    }

    async fn confirm_select(&self) -> Result<()> {
        self.0
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("confirm.select failed: {}", e)))
    }

    async fn queue_declare(&self, name: &str, durable: bool) -> Result<QueueInfo> {
        let queue = self
            .0
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::DeclareError {
                queue: name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn basic_publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: PublishProperties,
    ) -> Result<()> {
        let delivery_mode = if properties.persistent { 2 } else { 1 };
        let amqp_properties = BasicProperties::default()
            .with_message_id(properties.message_id.into())
            .with_kind(properties.message_type.into())
            .with_content_type("application/json".into())
            .with_timestamp(properties.timestamp)
            .with_delivery_mode(delivery_mode);

        let confirm = self
            .0
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                amqp_properties,
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        // Resolves to NotRequested when the channel is not in confirm mode
        let confirmation = confirm
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;
        if confirmation.is_nack() {
            return Err(RabbitMQError::PublishError(format!(
                "broker nacked message for queue '{}'",
                queue
            )));
        }
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .0
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        Ok(consumer
            .map(|delivery| delivery.map(InboundDelivery::from).map_err(RabbitMQError::from))
            .boxed())
    }

    async fn close(&self) -> Result<()> {
        if self.0.status().connected() {
            self.0
                .close(200, "Closing channel")
                .await
                .map_err(|e| RabbitMQError::ChannelError(e.to_string()))?;
        }
        Ok(())
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }
}

impl From<Delivery> for InboundDelivery {
    fn from(delivery: Delivery) -> Self {
        InboundDelivery {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            data: delivery.data,
            acker: Box::new(LapinAcker(delivery.acker)),
        }
    }
}
