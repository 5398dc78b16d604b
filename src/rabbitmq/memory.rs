// src/rabbitmq/memory.rs
//! In-process broker implementing the AMQP seam. Used by `memory://` URIs and
//! by the test-suite, where its counters and failure switches stand in for a
//! real RabbitMQ node.

use async_trait::async_trait;
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::amqp_client::{
    AmqpChannel, AmqpConnection, AmqpConnector, DeliveryAcker, DeliveryStream, InboundDelivery,
    PublishProperties, QueueInfo,
};
use super::consumer::Disposition;
use super::errors::{RabbitMQError, Result};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
}

struct MemoryQueue {
    durable: bool,
    tx: mpsc::UnboundedSender<StoredMessage>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<StoredMessage>>,
    depth: AtomicUsize,
}

impl MemoryQueue {
    fn new(durable: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            durable,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            depth: AtomicUsize::new(0),
        }
    }

    fn push(&self, message: StoredMessage) {
        self.depth.fetch_add(1, Ordering::SeqCst);
        // The receiver lives as long as the queue itself
        let _ = self.tx.send(message);
    }
}

struct BrokerState {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    epoch: watch::Sender<u64>,
    connect_attempts: AtomicU32,
    failing_connects: AtomicU32,
    declare_calls: AtomicUsize,
    next_delivery_tag: AtomicU64,
    published: Mutex<Vec<PublishProperties>>,
    dispositions: Mutex<Vec<(u64, Disposition)>>,
}

impl BrokerState {
    fn current_epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        self.queues
            .lock()
            .ok()
            .and_then(|queues| queues.get(name).cloned())
    }
}

/// Cheap to clone; all clones share one broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            state: Arc::new(BrokerState {
                queues: Mutex::new(HashMap::new()),
                epoch,
                connect_attempts: AtomicU32::new(0),
                failing_connects: AtomicU32::new(0),
                declare_calls: AtomicUsize::new(0),
                next_delivery_tag: AtomicU64::new(0),
                published: Mutex::new(Vec::new()),
                dispositions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.failing_connects.store(n, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn declare_calls(&self) -> usize {
        self.state.declare_calls.load(Ordering::SeqCst)
    }

    /// Sever every open connection; consumers see their delivery stream end.
    pub fn drop_connections(&self) {
        self.state.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Like a node restart: connections drop and non-durable queues are gone.
    pub fn restart(&self) {
        if let Ok(mut queues) = self.state.queues.lock() {
            queues.retain(|_, queue| queue.durable);
        }
        self.drop_connections();
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.state.queue(name).is_some()
    }

    /// Messages waiting in `name` (not yet delivered, or requeued).
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.state
            .queue(name)
            .map(|queue| queue.depth.load(Ordering::SeqCst))
    }

    /// Put raw bytes on a queue, bypassing any producer-side encoding.
    pub fn inject(&self, queue: &str, body: impl Into<Vec<u8>>) -> Result<()> {
        let target = self
            .state
            .queue(queue)
            .ok_or_else(|| RabbitMQError::PublishError(format!("no queue '{}'", queue)))?;
        target.push(StoredMessage {
            body: body.into(),
            redelivered: false,
        });
        Ok(())
    }

    pub fn published(&self) -> Vec<PublishProperties> {
        self.state
            .published
            .lock()
            .map(|published| published.clone())
            .unwrap_or_default()
    }

    /// Every ack/nack the broker has accepted, in arrival order.
    pub fn dispositions(&self) -> Vec<(u64, Disposition)> {
        self.state
            .dispositions
            .lock()
            .map(|dispositions| dispositions.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AmqpConnector for MemoryBroker {
    fn describe(&self) -> String {
        "memory://".to_string()
    }

    async fn connect(&self) -> Result<Box<dyn AmqpConnection>> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .state
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(RabbitMQError::ConnectionError(
                "connection refused (memory broker)".to_string(),
            ));
        }

        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
            epoch: self.state.current_epoch(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    state: Arc<BrokerState>,
    epoch: u64,
    closed: AtomicBool,
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.state.current_epoch() == self.epoch
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        if !self.is_connected() {
            return Err(RabbitMQError::ChannelError(
                "connection is not open".to_string(),
            ));
        }
        Ok(Arc::new(MemoryChannel {
            state: self.state.clone(),
            epoch: self.epoch,
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryChannel {
    state: Arc<BrokerState>,
    epoch: u64,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(RabbitMQError::ChannelError("channel is closed".to_string()))
        }
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.state.current_epoch() == self.epoch
    }

    async fn basic_qos(&self, _prefetch_count: u16) -> Result<()> {
        self.ensure_open()
    }

    async fn confirm_select(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn queue_declare(&self, name: &str, durable: bool) -> Result<QueueInfo> {
        self.ensure_open()?;
        self.state.declare_calls.fetch_add(1, Ordering::SeqCst);

        let mut queues = self
            .state
            .queues
            .lock()
            .map_err(|_| RabbitMQError::Unknown("queue table poisoned".to_string()))?;
        let queue = queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new(durable)));

        if queue.durable != durable {
            return Err(RabbitMQError::DeclareError {
                queue: name.to_string(),
                reason: format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' (declared {}, requested {})",
                    queue.durable, durable
                ),
            });
        }

        debug!(queue = name, durable, "memory broker declared queue");
        Ok(QueueInfo {
            name: name.to_string(),
            message_count: queue.depth.load(Ordering::SeqCst) as u32,
            consumer_count: 0,
        })
    }

    async fn basic_publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: PublishProperties,
    ) -> Result<()> {
        self.ensure_open()
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;
        let target = self.state.queue(queue).ok_or_else(|| {
            RabbitMQError::PublishError(format!("NOT_FOUND - no queue '{}'", queue))
        })?;

        target.push(StoredMessage {
            body: payload.to_vec(),
            redelivered: false,
        });
        if let Ok(mut published) = self.state.published.lock() {
            published.push(properties);
        }
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;
        let target = self.state.queue(queue).ok_or_else(|| {
            RabbitMQError::ConsumeError(format!("NOT_FOUND - no queue '{}'", queue))
        })?;

        let epoch = self.epoch;
        let epoch_rx = self.state.epoch.subscribe();
        let state = self.state.clone();

        let stream = futures::stream::unfold(
            (target, epoch_rx, state),
            move |(queue, mut epoch_rx, state)| async move {
                let next = {
                    let mut rx = queue.rx.lock().await;
                    tokio::select! {
                        biased;
                        _ = connection_lost(&mut epoch_rx, epoch) => None,
                        message = rx.recv() => message,
                    }
                };
                let message = next?;
                queue.depth.fetch_sub(1, Ordering::SeqCst);

                let delivery_tag = state.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
                let delivery = InboundDelivery {
                    delivery_tag,
                    redelivered: message.redelivered,
                    data: message.body.clone(),
                    acker: Box::new(MemoryAcker {
                        state: state.clone(),
                        queue: queue.clone(),
                        epoch,
                        delivery_tag,
                        message,
                        settled: AtomicBool::new(false),
                    }),
                };
                Some((Ok(delivery), (queue, epoch_rx, state)))
            },
        );

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

async fn connection_lost(epoch_rx: &mut watch::Receiver<u64>, epoch: u64) {
    loop {
        let current = *epoch_rx.borrow_and_update();
        if current != epoch {
            return;
        }
        if epoch_rx.changed().await.is_err() {
            return;
        }
    }
}

struct MemoryAcker {
    state: Arc<BrokerState>,
    queue: Arc<MemoryQueue>,
    epoch: u64,
    delivery_tag: u64,
    message: StoredMessage,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self, disposition: Disposition) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(RabbitMQError::AckError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                self.delivery_tag
            )));
        }
        if self.state.current_epoch() != self.epoch {
            // The channel died first: the broker takes the message back
            self.queue.push(StoredMessage {
                body: self.message.body.clone(),
                redelivered: true,
            });
            return Err(RabbitMQError::AckError("channel is closed".to_string()));
        }

        if let Disposition::Nacked { requeue: true } = disposition {
            self.queue.push(StoredMessage {
                body: self.message.body.clone(),
                redelivered: true,
            });
        }
        if let Ok(mut dispositions) = self.state.dispositions.lock() {
            dispositions.push((self.delivery_tag, disposition));
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(Disposition::Acked)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(Disposition::Nacked { requeue })
    }
}
