//! Entity lifecycle events over RabbitMQ.
//!
//! Producers publish `entity.created` / `entity.updated` / `entity.deleted`
//! documents onto a durable queue; a worker consumes them, applies each one
//! through an [`EntityStore`](store::EntityStore) and acks or nacks the
//! delivery based on the outcome.

pub mod config;
pub mod dispatch;
pub mod env;
pub mod message;
pub mod rabbitmq;
pub mod store;
