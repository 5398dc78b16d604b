// src/rabbitmq/queue.rs
//! Declares queues once per name and remembers the result.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::connection::ConnectionSupervisor;
use super::errors::{RabbitMQError, Result};

/// What happens to cached declarations when the supervisor reconnects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueCachePolicy {
    /// Trust the cache for the registrar's lifetime.
    #[default]
    KeepAcrossReconnects,
    /// Redeclare a queue first used under an older connection, for brokers
    /// that may lose server-side queue state (e.g. transient queues on restart).
    InvalidateOnReconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queue {
    pub name: String,
    pub durable: bool,
    /// Counts as reported by the broker at declaration time.
    pub message_count: u32,
    pub consumer_count: u32,
}

struct CachedQueue {
    queue: Arc<Queue>,
    generation: u64,
}

pub struct QueueRegistrar {
    supervisor: Arc<ConnectionSupervisor>,
    policy: QueueCachePolicy,
    queues: Mutex<HashMap<String, CachedQueue>>,
}

impl QueueRegistrar {
    pub fn new(supervisor: Arc<ConnectionSupervisor>, policy: QueueCachePolicy) -> Self {
        Self {
            supervisor,
            policy,
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> QueueCachePolicy {
        self.policy
    }

    /// Returns the cached handle for `name`, declaring the queue on the broker
    /// only the first time. The cache lock is held across the declare call, so
    /// concurrent callers for one name produce a single broker round-trip.
    pub async fn declare_queue(&self, name: &str, durable: bool) -> Result<Arc<Queue>> {
        let mut queues = self.queues.lock().await;

        // Under InvalidateOnReconnect the cache is checked against the live
        // connection, which may mean reconnecting first
        let live_generation = match self.policy {
            QueueCachePolicy::KeepAcrossReconnects => None,
            QueueCachePolicy::InvalidateOnReconnect => {
                Some(self.supervisor.get_channel().await?.generation())
            }
        };

        if let Some(cached) = queues.get(name) {
            if live_generation.map_or(true, |generation| generation == cached.generation) {
                debug!(queue = name, "rabbitmq: queue already declared, returning existing one");
                return Ok(cached.queue.clone());
            }
            info!(queue = name, "rabbitmq: connection was re-established, redeclaring queue");
        }

        let channel = self.supervisor.get_channel().await?;
        let declared = channel
            .queue_declare(name, durable)
            .await
            .map_err(|e| match e {
                declare @ RabbitMQError::DeclareError { .. } => declare,
                other => RabbitMQError::DeclareError {
                    queue: name.to_string(),
                    reason: other.to_string(),
                },
            })?;

        let queue = Arc::new(Queue {
            name: declared.name,
            durable,
            message_count: declared.message_count,
            consumer_count: declared.consumer_count,
        });
        queues.insert(
            name.to_string(),
            CachedQueue {
                queue: queue.clone(),
                generation: channel.generation(),
            },
        );

        info!(
            queue = name,
            durable,
            messages = queue.message_count,
            "rabbitmq: queue declared successfully"
        );
        Ok(queue)
    }

    pub async fn is_declared(&self, name: &str) -> bool {
        self.queues.lock().await.contains_key(name)
    }

    /// Forget `name`; the next `declare_queue` goes to the broker again.
    pub async fn invalidate(&self, name: &str) -> bool {
        self.queues.lock().await.remove(name).is_some()
    }

    pub async fn invalidate_all(&self) {
        self.queues.lock().await.clear();
    }
}
