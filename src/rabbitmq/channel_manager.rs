use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::amqp_client::{
    AmqpChannel, DeliveryAcker, DeliveryStream, PublishProperties, QueueInfo,
};
use super::errors::Result;

/// Configuration options for a RabbitMQ channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed (0 means unlimited)
    pub prefetch_count: u16,

    /// Whether to use publisher confirms
    pub confirm_mode: bool,

    /// Channel identifier for logging (defaults to a UUID)
    pub id: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 10,
            confirm_mode: true,
            id: format!("channel-{}", &Uuid::new_v4().to_string()[..8]),
        }
    }
}

/// Apply prefetch and confirm mode to a freshly opened channel.
pub(crate) async fn configure_channel(channel: &dyn AmqpChannel, config: &ChannelConfig) -> Result<()> {
    if config.prefetch_count > 0 {
        channel.basic_qos(config.prefetch_count).await?;
    }
    if config.confirm_mode {
        channel.confirm_select().await?;
    }
    debug!(
        channel_id = %config.id,
        prefetch = %config.prefetch_count,
        confirm = %config.confirm_mode,
        "Configured channel"
    );
    Ok(())
}

/// The supervisor's live channel as seen by producers and consumers.
///
/// Every broker operation takes the supervisor-wide operation lock, so declare,
/// publish, consume and ack/nack never interleave on the channel.
#[derive(Clone)]
pub struct ChannelHandle {
    channel: Arc<dyn AmqpChannel>,
    ops: Arc<Mutex<()>>,
    generation: u64,
    id: String,
}

impl ChannelHandle {
    pub(crate) fn new(
        channel: Arc<dyn AmqpChannel>,
        ops: Arc<Mutex<()>>,
        generation: u64,
        id: String,
    ) -> Self {
        Self {
            channel,
            ops,
            generation,
            id,
        }
    }

    /// Connection generation this channel was opened under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub async fn queue_declare(&self, name: &str, durable: bool) -> Result<QueueInfo> {
        let _guard = self.ops.lock().await;
        self.channel.queue_declare(name, durable).await
    }

    pub async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: PublishProperties,
    ) -> Result<()> {
        let _guard = self.ops.lock().await;
        self.channel.basic_publish(queue, payload, properties).await
    }

    pub async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let _guard = self.ops.lock().await;
        self.channel.basic_consume(queue, consumer_tag).await
    }

    pub async fn ack(&self, acker: &dyn DeliveryAcker) -> Result<()> {
        let _guard = self.ops.lock().await;
        acker.ack().await
    }

    pub async fn nack(&self, acker: &dyn DeliveryAcker, requeue: bool) -> Result<()> {
        let _guard = self.ops.lock().await;
        acker.nack(requeue).await
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("open", &self.channel.is_open())
            .finish()
    }
}
