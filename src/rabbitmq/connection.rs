// src/rabbitmq/connection.rs
//! Owns the broker connection and its single channel.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedRwLockReadGuard, RwLock};
use tracing::{debug, error, info, warn};

use super::amqp_client::{AmqpChannel, AmqpConnection, AmqpConnector};
use super::backoff::{BackoffPolicy, LinearBackoff};
use super::channel_manager::{configure_channel, ChannelConfig, ChannelHandle};
use super::errors::{RabbitMQError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Default)]
struct Slot {
    connection: Option<Box<dyn AmqpConnection>>,
    channel: Option<Arc<dyn AmqpChannel>>,
}

/// Constructed once per process and shared (`Arc`) with the registrar,
/// producer and consumer.
pub struct ConnectionSupervisor {
    connector: Arc<dyn AmqpConnector>,
    backoff: Arc<dyn BackoffPolicy>,
    channel_config: ChannelConfig,
    // Held for the whole connect attempt, so concurrent callers queue up
    slot: Mutex<Slot>,
    channel_ops: Arc<Mutex<()>>,
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
    consumers: Arc<RwLock<()>>,
}

impl ConnectionSupervisor {
    pub fn new(connector: Arc<dyn AmqpConnector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            backoff: Arc::new(LinearBackoff::default()),
            channel_config: ChannelConfig::default(),
            slot: Mutex::new(Slot::default()),
            channel_ops: Arc::new(Mutex::new(())),
            state,
            generation: AtomicU64::new(0),
            consumers: Arc::new(RwLock::new(())),
        }
    }

    pub fn with_backoff(mut self, policy: impl BackoffPolicy + 'static) -> Self {
        self.backoff = Arc::new(policy);
        self
    }

    pub fn with_channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel_config = config;
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Bumped on every successful (re)connect.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Establish a connection and its channel if none is live. No-op when
    /// already connected.
    pub async fn connect(&self) -> Result<()> {
        self.get_channel().await.map(|_| ())
    }

    /// The live channel, reconnecting and reopening it first if needed.
    pub async fn get_channel(&self) -> Result<ChannelHandle> {
        let mut slot = self.slot.lock().await;
        self.connect_locked(&mut slot).await?;

        let channel = match slot.channel.as_ref().filter(|channel| channel.is_open()) {
            Some(channel) => channel.clone(),
            None => {
                let connection = slot.connection.as_ref().ok_or_else(|| {
                    RabbitMQError::ConnectionError("No active connection".to_string())
                })?;
                debug!(channel_id = %self.channel_config.id, "Creating new channel");
                let channel = connection.create_channel().await?;
                configure_channel(channel.as_ref(), &self.channel_config).await?;
                slot.channel = Some(channel.clone());
                channel
            }
        };

        Ok(ChannelHandle::new(
            channel,
            self.channel_ops.clone(),
            self.generation(),
            self.channel_config.id.clone(),
        ))
    }

    /// Release channel and connection. Waits for running consumer loops to
    /// settle their in-flight message first. A second call is a no-op.
    pub async fn close(&self) -> Result<()> {
        let closing = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        });
        if !closing {
            debug!("rabbitmq: supervisor already closed");
            return Ok(());
        }

        info!("rabbitmq: closing, waiting for consumers to finish");
        let _drained = self.consumers.write().await;

        let mut slot = self.slot.lock().await;
        if let Some(channel) = slot.channel.take() {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "rabbitmq: failed to close channel");
            }
        }
        if let Some(connection) = slot.connection.take() {
            connection.close().await?;
            info!(broker = %self.connector.describe(), "rabbitmq: connection closed");
        }
        Ok(())
    }

    /// Held by each consumer loop for its lifetime so `close` can wait on it.
    pub(crate) async fn register_consumer(&self) -> Result<OwnedRwLockReadGuard<()>> {
        if self.is_closed() {
            return Err(RabbitMQError::Closed);
        }
        Ok(self.consumers.clone().read_owned().await)
    }

    fn set_state(&self, next: ConnectionState) {
        // Closed is terminal
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }

    async fn connect_locked(&self, slot: &mut Slot) -> Result<()> {
        if self.is_closed() {
            return Err(RabbitMQError::Closed);
        }
        if slot
            .connection
            .as_ref()
            .is_some_and(|connection| connection.is_connected())
        {
            return Ok(());
        }

        slot.channel = None;
        slot.connection = None;
        self.set_state(ConnectionState::Connecting);

        let target = self.connector.describe();
        let max_retries = self.backoff.max_retries();
        info!(broker = %target, "rabbitmq: trying to connect");

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.connector.connect().await {
                Ok(connection) => {
                    slot.connection = Some(connection);
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    self.set_state(ConnectionState::Connected);
                    info!(broker = %target, attempt, generation, "rabbitmq: connected successfully");
                    return Ok(());
                }
                Err(err) if err.is_recoverable() => {
                    if attempt > max_retries {
                        error!(
                            broker = %target,
                            attempts = attempt,
                            "rabbitmq: exceeded maximum number of connection retries"
                        );
                        self.set_state(ConnectionState::Disconnected);
                        return Err(RabbitMQError::ConnectionExhausted { attempts: attempt });
                    }

                    let wait = self.backoff.delay(attempt);
                    warn!(
                        broker = %target,
                        attempt,
                        max_retries,
                        wait_secs = wait.as_secs_f64(),
                        reason = %err,
                        "rabbitmq: connection failed, retrying"
                    );
                    if !self.sleep_unless_closed(wait).await {
                        return Err(RabbitMQError::Closed);
                    }
                }
                Err(err) => {
                    error!(broker = %target, reason = %err, "rabbitmq: connection failed, not retrying");
                    self.set_state(ConnectionState::Disconnected);
                    return Err(err);
                }
            }
        }
    }

    /// Returns false when `close` interrupted the wait.
    async fn sleep_unless_closed(&self, wait: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(wait) => true,
            _ = wait_closed(self.watch_state()) => false,
        }
    }
}

/// Resolves once the supervisor reaches `Closed`.
pub(crate) async fn wait_closed(mut state: watch::Receiver<ConnectionState>) {
    loop {
        let closed = *state.borrow_and_update() == ConnectionState::Closed;
        if closed {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

impl fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("target", &self.connector.describe())
            .field("state", &self.state())
            .field("generation", &self.generation())
            .field("backoff", &self.backoff)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::memory::MemoryBroker;
    use tokio::time::Instant;

    fn supervisor(broker: &MemoryBroker, max_retries: u32) -> ConnectionSupervisor {
        ConnectionSupervisor::new(Arc::new(broker.clone()))
            .with_backoff(LinearBackoff::new(Duration::from_secs(2), max_retries))
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_with_linear_backoff() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(3);
        let supervisor = supervisor(&broker, 10);

        let started = Instant::now();
        supervisor.connect().await.unwrap();

        assert_eq!(broker.connect_attempts(), 4);
        // 2 + 4 + 6 seconds of backoff
        assert_eq!(started.elapsed().as_secs(), 12);
        assert_eq!(supervisor.state(), ConnectionState::Connected);
        assert_eq!(supervisor.generation(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_succeeds_on_every_retry_up_to_the_limit() {
        let max_retries = 4;
        for failures in 0..=max_retries {
            let broker = MemoryBroker::new();
            broker.fail_next_connects(failures);
            let supervisor = supervisor(&broker, max_retries);

            let started = Instant::now();
            supervisor.connect().await.unwrap();

            assert_eq!(broker.connect_attempts(), failures + 1);
            // 2 * (1 + 2 + ... + failures) seconds
            assert_eq!(
                started.elapsed().as_secs(),
                u64::from(failures * (failures + 1))
            );
            assert_eq!(supervisor.state(), ConnectionState::Connected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_permitted_retry_waits_longest() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(3);
        let supervisor = supervisor(&broker, 3);

        let started = Instant::now();
        let connecting = tokio::spawn(async move {
            supervisor.connect().await.map(|_| supervisor)
        });

        // attempt 3 fails at 6s; attempt 4 is not due until 12s
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(broker.connect_attempts(), 3);

        let supervisor = connecting.await.unwrap().unwrap();
        assert_eq!(broker.connect_attempts(), 4);
        assert_eq!(started.elapsed().as_secs(), 12);
        assert_eq!(supervisor.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_exhausts_after_max_retries() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(u32::MAX);
        let supervisor = supervisor(&broker, 3);

        let err = supervisor.connect().await.unwrap_err();
        assert!(matches!(err, RabbitMQError::ConnectionExhausted { attempts: 4 }));
        assert_eq!(broker.connect_attempts(), 4);
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let broker = MemoryBroker::new();
        let supervisor = supervisor(&broker, 10);

        supervisor.connect().await.unwrap();
        supervisor.connect().await.unwrap();
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_open_one_connection() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(1);
        let supervisor = Arc::new(supervisor(&broker, 10));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let supervisor = supervisor.clone();
            tasks.push(tokio::spawn(async move { supervisor.connect().await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        // one refused attempt, one success, nobody raced a second connection
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(supervisor.generation(), 1);
    }

    #[tokio::test]
    async fn test_get_channel_reconnects_after_drop() {
        let broker = MemoryBroker::new();
        let supervisor = supervisor(&broker, 10);

        let first = supervisor.get_channel().await.unwrap();
        broker.drop_connections();
        assert!(!first.is_open());

        let second = supervisor.get_channel().await.unwrap();
        assert!(second.is_open());
        assert_eq!(second.generation(), 2);
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_terminal() {
        let broker = MemoryBroker::new();
        let supervisor = supervisor(&broker, 10);

        // never connected
        supervisor.close().await.unwrap();
        supervisor.close().await.unwrap();
        assert_eq!(supervisor.state(), ConnectionState::Closed);
        assert!(matches!(
            supervisor.get_channel().await.unwrap_err(),
            RabbitMQError::Closed
        ));
        assert_eq!(broker.connect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_interrupts_backoff() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(u32::MAX);
        let supervisor = Arc::new(supervisor(&broker, 10));

        let connecting = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.connect().await })
        };
        tokio::time::sleep(Duration::from_secs(3)).await;
        supervisor.close().await.unwrap();

        let err = connecting.await.unwrap().unwrap_err();
        assert!(matches!(err, RabbitMQError::Closed));
        assert_eq!(supervisor.state(), ConnectionState::Closed);
    }
}
