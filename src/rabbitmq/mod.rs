// src/rabbitmq/mod.rs
// RabbitMQ integration: supervised connection, queue declarations, producer and consumer

pub mod errors;
pub mod connection;
pub mod consumer;
pub mod memory;
pub mod queue;

// Private implementation details
mod amqp_client;
mod backoff;
mod channel_manager;
mod publisher;

pub use amqp_client::{
    AmqpChannel, AmqpConnection, AmqpConnector, DeliveryAcker, DeliveryStream, InboundDelivery,
    PublishProperties, QueueInfo, RabbitMqClient, describe_uri,
};
pub use backoff::{BackoffPolicy, LinearBackoff};
pub use channel_manager::{ChannelConfig, ChannelHandle};
pub use connection::{ConnectionState, ConnectionSupervisor};
pub use consumer::{
    ConsumerConfig, DeliveredMessage, Disposition, MessageConsumer, StatsSnapshot, Subscription,
    SubscriptionState,
};
pub use errors::{RabbitMQError, Result};
pub use memory::MemoryBroker;
pub use publisher::MessageProducer;
pub use queue::{Queue, QueueCachePolicy, QueueRegistrar};
