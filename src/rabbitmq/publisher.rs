use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::amqp_client::PublishProperties;
use super::connection::ConnectionSupervisor;
use super::errors::{RabbitMQError, Result};
use crate::message::Event;

/// Publishes events onto one queue through the supervised channel.
///
/// There is no retry here: a publish usually sits on a request path, so the
/// caller decides whether a failure is worth another attempt. The queue is
/// expected to have been declared at startup.
pub struct MessageProducer {
    supervisor: Arc<ConnectionSupervisor>,
    queue: String,
    timeout: Duration,
}

impl MessageProducer {
    pub fn new(supervisor: Arc<ConnectionSupervisor>, queue: &str) -> Self {
        Self {
            supervisor,
            queue: queue.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Upper bound on one publish, including any reconnect it triggers.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn publish(&self, event: &Event) -> Result<()> {
        let payload = event.to_bytes()?;
        let properties = PublishProperties {
            message_id: Uuid::new_v4().to_string(),
            message_type: event.event_type().to_string(),
            timestamp: chrono::Utc::now().timestamp() as u64,
            persistent: true,
        };
        let message_id = properties.message_id.clone();

        tokio::time::timeout(self.timeout, async {
            let channel = self.supervisor.get_channel().await?;
            debug!(channel_id = %channel.id(), queue = %self.queue, "publishing event");
            channel
                .publish(&self.queue, &payload, properties)
                .await
                .map_err(|e| match e {
                    publish @ RabbitMQError::PublishError(_) => publish,
                    other => RabbitMQError::PublishError(other.to_string()),
                })
        })
        .await
        .map_err(|_| {
            RabbitMQError::TimeoutError(format!(
                "publish to '{}' did not complete within {:?}",
                self.queue, self.timeout
            ))
        })??;

        info!(
            queue = %self.queue,
            event_type = event.event_type(),
            message_id = %message_id,
            "Published event"
        );
        Ok(())
    }
}
