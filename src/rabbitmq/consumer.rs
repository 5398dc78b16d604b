// src/rabbitmq/consumer.rs
//! Consume → decode → dispatch → ack/nack.

use futures::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, OwnedRwLockReadGuard, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::amqp_client::{DeliveryAcker, DeliveryStream, InboundDelivery};
use super::channel_manager::ChannelHandle;
use super::connection::{wait_closed, ConnectionSupervisor};
use super::errors::{RabbitMQError, Result};
use super::queue::QueueRegistrar;
use crate::dispatch::{EventHandler, Outcome};
use crate::message::Event;

/// Terminal state of one delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Nacked { requeue: bool },
}

impl Disposition {
    /// Success acks; every failure is dropped from the queue (no requeue), so
    /// a poison message cannot loop forever.
    pub fn for_outcome(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Success => Disposition::Acked,
            Outcome::Conflict(_) | Outcome::NotFound | Outcome::InternalError(_) => {
                Disposition::Nacked { requeue: false }
            }
        }
    }
}

/// A delivery awaiting its one and only disposition. `settle` consumes it;
/// dropping it unsettled is logged as a bug.
pub struct DeliveredMessage {
    delivery_tag: u64,
    redelivered: bool,
    body: Vec<u8>,
    acker: Option<Box<dyn DeliveryAcker>>,
}

impl DeliveredMessage {
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub async fn settle(mut self, channel: &ChannelHandle, disposition: Disposition) -> Result<Disposition> {
        let acker = self.acker.take().ok_or_else(|| {
            RabbitMQError::AckError(format!("delivery {} already settled", self.delivery_tag))
        })?;
        match disposition {
            Disposition::Acked => channel.ack(acker.as_ref()).await?,
            Disposition::Nacked { requeue } => channel.nack(acker.as_ref(), requeue).await?,
        }
        Ok(disposition)
    }
}

impl From<InboundDelivery> for DeliveredMessage {
    fn from(delivery: InboundDelivery) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            body: delivery.data,
            acker: Some(delivery.acker),
        }
    }
}

impl Drop for DeliveredMessage {
    fn drop(&mut self) {
        if self.acker.is_some() {
            error!(
                delivery_tag = self.delivery_tag,
                "delivered message dropped without ack or nack"
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Subscribed,
    Stopped,
}

#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    decode_failures: AtomicU64,
    settle_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub acked: u64,
    pub nacked: u64,
    pub decode_failures: u64,
    pub settle_failures: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::SeqCst),
            acked: self.acked.load(Ordering::SeqCst),
            nacked: self.nacked.load(Ordering::SeqCst),
            decode_failures: self.decode_failures.load(Ordering::SeqCst),
            settle_failures: self.settle_failures.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub durable: bool,
    /// Messages processed at once. 1 keeps broker order.
    pub concurrency: usize,
    pub consumer_tag_prefix: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            durable: true,
            concurrency: 1,
            consumer_tag_prefix: "entity-consumer".to_string(),
        }
    }
}

/// Handle to a running consume loop.
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    stats: Arc<ConsumerStats>,
    state: watch::Receiver<SubscriptionState>,
    stop: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Ask this loop to stop after settling what it has in flight.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Resolves once the loop has stopped, for whatever reason.
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        loop {
            let stopped = *state.borrow_and_update() == SubscriptionState::Stopped;
            if stopped || state.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn join(self) -> Result<()> {
        self.handle
            .await
            .map_err(|e| RabbitMQError::ConsumeError(format!("consumer task failed: {}", e)))?
    }
}

pub struct MessageConsumer {
    supervisor: Arc<ConnectionSupervisor>,
    registrar: Arc<QueueRegistrar>,
    config: ConsumerConfig,
}

impl MessageConsumer {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        registrar: Arc<QueueRegistrar>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            supervisor,
            registrar,
            config,
        }
    }

    /// Declare `queue_name` and start consuming it on a background task.
    /// Setup errors are returned here; later message-level failures are
    /// resolved into dispositions inside the loop.
    pub async fn subscribe(&self, queue_name: &str, handler: Arc<dyn EventHandler>) -> Result<Subscription> {
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Idle);
        let guard = self.supervisor.register_consumer().await?;

        let queue = self
            .registrar
            .declare_queue(queue_name, self.config.durable)
            .await?;
        let consumer_tag = format!(
            "{}-{}",
            self.config.consumer_tag_prefix,
            &Uuid::new_v4().to_string()[..8]
        );
        let channel = self.supervisor.get_channel().await?;
        let stream = channel.consume(&queue.name, &consumer_tag).await?;

        state_tx.send_replace(SubscriptionState::Subscribed);
        info!(queue = %queue.name, consumer_tag = %consumer_tag, "Started consuming from queue");

        let stats = Arc::new(ConsumerStats::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = ConsumeLoop {
            supervisor: self.supervisor.clone(),
            registrar: self.registrar.clone(),
            queue: queue.name.clone(),
            durable: self.config.durable,
            consumer_tag: consumer_tag.clone(),
            concurrency: self.config.concurrency.max(1),
            handler,
            stats: stats.clone(),
            state: state_tx,
            stop: stop_rx,
        };
        let handle = tokio::spawn(worker.run(stream, channel, guard));

        Ok(Subscription {
            queue: queue.name.clone(),
            consumer_tag,
            stats,
            state: state_rx,
            stop: stop_tx,
            handle,
        })
    }
}

enum Step {
    Deliver(InboundDelivery),
    Interrupted(Option<RabbitMQError>),
    Shutdown,
}

struct ConsumeLoop {
    supervisor: Arc<ConnectionSupervisor>,
    registrar: Arc<QueueRegistrar>,
    queue: String,
    durable: bool,
    consumer_tag: String,
    concurrency: usize,
    handler: Arc<dyn EventHandler>,
    stats: Arc<ConsumerStats>,
    state: watch::Sender<SubscriptionState>,
    stop: watch::Receiver<bool>,
}

impl ConsumeLoop {
    async fn run(
        mut self,
        mut stream: DeliveryStream,
        mut channel: ChannelHandle,
        _guard: OwnedRwLockReadGuard<()>,
    ) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = JoinSet::new();

        let result = loop {
            let step = tokio::select! {
                biased;
                _ = wait_closed(self.supervisor.watch_state()) => Step::Shutdown,
                _ = stop_requested(&mut self.stop) => Step::Shutdown,
                delivery = stream.next() => match delivery {
                    Some(Ok(delivery)) => Step::Deliver(delivery),
                    Some(Err(e)) => Step::Interrupted(Some(e)),
                    None => Step::Interrupted(None),
                },
            };

            match step {
                Step::Shutdown => break Ok(()),
                Step::Deliver(delivery) => {
                    let permit = match permits.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break Err(RabbitMQError::ConsumeError("worker pool closed".to_string())),
                    };
                    let processing = process_delivery(
                        delivery,
                        channel.clone(),
                        self.handler.clone(),
                        self.stats.clone(),
                        self.queue.clone(),
                    );
                    in_flight.spawn(async move {
                        processing.await;
                        drop(permit);
                    });
                    while let Some(finished) = in_flight.try_join_next() {
                        log_task_failure(finished);
                    }
                }
                Step::Interrupted(reason) => {
                    match &reason {
                        Some(e) => warn!(queue = %self.queue, error = %e, "Error receiving message, resubscribing"),
                        None => warn!(queue = %self.queue, "Delivery stream ended, resubscribing"),
                    }
                    // Settle everything taken from the old channel before moving on
                    while let Some(finished) = in_flight.join_next().await {
                        log_task_failure(finished);
                    }
                    match self.resubscribe().await {
                        Ok((next_stream, next_channel)) => {
                            stream = next_stream;
                            channel = next_channel;
                        }
                        Err(RabbitMQError::Closed) => break Ok(()),
                        Err(e) => {
                            error!(queue = %self.queue, error = %e, "Could not resubscribe, consumer stopping");
                            break Err(e);
                        }
                    }
                }
            }
        };

        while let Some(finished) = in_flight.join_next().await {
            log_task_failure(finished);
        }
        self.state.send_replace(SubscriptionState::Stopped);
        info!(queue = %self.queue, consumer_tag = %self.consumer_tag, stats = ?self.stats.snapshot(), "Consumer stopped");
        result
    }

    async fn resubscribe(&self) -> Result<(DeliveryStream, ChannelHandle)> {
        if self.supervisor.is_closed() {
            return Err(RabbitMQError::Closed);
        }
        let queue = self.registrar.declare_queue(&self.queue, self.durable).await?;
        let channel = self.supervisor.get_channel().await?;
        let stream = channel.consume(&queue.name, &self.consumer_tag).await?;
        info!(queue = %queue.name, generation = channel.generation(), "Resubscribed to queue");
        Ok((stream, channel))
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        let requested = *stop.borrow_and_update();
        if requested {
            return;
        }
        if stop.changed().await.is_err() {
            // Subscription handle dropped: keep running detached
            futures::future::pending::<()>().await;
        }
    }
}

fn log_task_failure(finished: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = finished {
        error!(error = %e, "message processing task failed");
    }
}

async fn process_delivery(
    delivery: InboundDelivery,
    channel: ChannelHandle,
    handler: Arc<dyn EventHandler>,
    stats: Arc<ConsumerStats>,
    queue: String,
) {
    let message = DeliveredMessage::from(delivery);
    let delivery_tag = message.delivery_tag();
    stats.received.fetch_add(1, Ordering::SeqCst);

    let disposition = match Event::from_slice(message.body()) {
        Ok(event) => {
            let event_type = event.event_type();
            debug!(queue = %queue, delivery_tag, event_type, redelivered = message.redelivered(), "Received event");

            let outcome = match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => Outcome::InternalError("event handler panicked".to_string()),
            };
            if !outcome.is_success() {
                warn!(queue = %queue, delivery_tag, event_type, outcome = %outcome, "Event rejected");
            }
            Disposition::for_outcome(&outcome)
        }
        Err(e) => {
            stats.decode_failures.fetch_add(1, Ordering::SeqCst);
            error!(queue = %queue, delivery_tag, error = %e, "Failed to deserialize message");
            Disposition::Nacked { requeue: false }
        }
    };

    match message.settle(&channel, disposition).await {
        Ok(Disposition::Acked) => {
            stats.acked.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Disposition::Nacked { .. }) => {
            stats.nacked.fetch_add(1, Ordering::SeqCst);
        }
        Err(e) => {
            stats.settle_failures.fetch_add(1, Ordering::SeqCst);
            error!(queue = %queue, delivery_tag, error = %e, "Failed to settle message");
        }
    }
}
