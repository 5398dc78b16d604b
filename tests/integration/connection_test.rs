// Integration tests don't need module declarations like unit tests
// Each file in the tests directory is treated as its own separate crate

use entity_events::config::AppConfig;
use entity_events::env::EnvOverrides;
use entity_events::message::Event;
use entity_events::rabbitmq::{
    ConnectionState, ConnectionSupervisor, LinearBackoff, MemoryBroker, MessageProducer,
    QueueCachePolicy, QueueRegistrar, RabbitMQError, RabbitMqClient,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn supervisor(broker: &MemoryBroker, max_retries: u32) -> Arc<ConnectionSupervisor> {
    Arc::new(
        ConnectionSupervisor::new(Arc::new(broker.clone()))
            .with_backoff(LinearBackoff::new(Duration::from_secs(2), max_retries)),
    )
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_surface_through_get_channel() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(u32::MAX);
    let supervisor = supervisor(&broker, 2);

    let started = Instant::now();
    let err = supervisor.get_channel().await.unwrap_err();

    assert!(matches!(err, RabbitMQError::ConnectionExhausted { attempts: 3 }));
    // waits of 2s and 4s between the three attempts
    assert_eq!(started.elapsed().as_secs(), 6);
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);

    // the broker comes back: the next call connects from scratch
    broker.fail_next_connects(0);
    supervisor.get_channel().await.unwrap();
    assert_eq!(supervisor.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_state_changes_are_observable() {
    let broker = MemoryBroker::new();
    let supervisor = supervisor(&broker, 10);
    let mut states = supervisor.watch_state();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);

    supervisor.connect().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);

    supervisor.close().await.unwrap();
    states.changed().await.unwrap();
    assert_eq!(*states.borrow(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_concurrent_declares_reach_the_broker_once() {
    let broker = MemoryBroker::new();
    let registrar = Arc::new(QueueRegistrar::new(
        supervisor(&broker, 10),
        QueueCachePolicy::KeepAcrossReconnects,
    ));

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let registrar = registrar.clone();
        tasks.push(tokio::spawn(async move {
            registrar.declare_queue("entity_queue", true).await
        }));
    }
    let mut queues = Vec::new();
    for task in tasks {
        queues.push(task.await.unwrap().unwrap());
    }

    assert_eq!(broker.declare_calls(), 1);
    assert!(queues.iter().all(|queue| Arc::ptr_eq(queue, &queues[0])));
}

#[tokio::test]
async fn test_inequivalent_redeclare_is_not_cached() {
    let broker = MemoryBroker::new();
    let registrar = QueueRegistrar::new(supervisor(&broker, 10), QueueCachePolicy::default());

    registrar.declare_queue("entity_queue", true).await.unwrap();
    registrar.declare_queue("other", true).await.unwrap();

    // same name, different durability, from a second registrar with a cold cache
    let cold = QueueRegistrar::new(supervisor(&broker, 10), QueueCachePolicy::default());
    let err = cold.declare_queue("entity_queue", false).await.unwrap_err();
    assert!(matches!(err, RabbitMQError::DeclareError { .. }));
    assert!(!cold.is_declared("entity_queue").await);

    // retried by the caller, it is attempted again rather than served from cache
    assert!(cold.declare_queue("entity_queue", false).await.is_err());
    assert_eq!(broker.declare_calls(), 4);
}

#[tokio::test]
async fn test_invalidate_policy_recreates_queue_after_restart() {
    let broker = MemoryBroker::new();
    let supervisor = supervisor(&broker, 10);
    let registrar = QueueRegistrar::new(supervisor.clone(), QueueCachePolicy::InvalidateOnReconnect);
    let producer = MessageProducer::new(supervisor, "transient");

    registrar.declare_queue("transient", false).await.unwrap();
    broker.restart();
    assert!(!broker.queue_exists("transient"));

    registrar.declare_queue("transient", false).await.unwrap();
    assert!(broker.queue_exists("transient"));
    producer.publish(&Event::deleted(7)).await.unwrap();
    assert_eq!(broker.queue_depth("transient"), Some(1));
}

#[tokio::test]
async fn test_keep_policy_trusts_cache_after_restart() {
    let broker = MemoryBroker::new();
    let supervisor = supervisor(&broker, 10);
    let registrar = QueueRegistrar::new(supervisor.clone(), QueueCachePolicy::KeepAcrossReconnects);

    registrar.declare_queue("transient", false).await.unwrap();
    broker.restart();
    registrar.declare_queue("transient", false).await.unwrap();

    assert_eq!(broker.declare_calls(), 1);
    // the stale entry means publishing now fails; dropping it repairs things
    let producer = MessageProducer::new(supervisor, "transient");
    assert!(matches!(
        producer.publish(&Event::deleted(1)).await.unwrap_err(),
        RabbitMQError::PublishError(_)
    ));
    assert!(registrar.invalidate("transient").await);
    registrar.declare_queue("transient", false).await.unwrap();
    producer.publish(&Event::deleted(1)).await.unwrap();
}

#[tokio::test]
async fn test_close_without_connect_is_safe() {
    let broker = MemoryBroker::new();
    let supervisor = supervisor(&broker, 10);

    supervisor.close().await.unwrap();
    supervisor.close().await.unwrap();
    assert!(supervisor.is_closed());
    assert_eq!(broker.connect_attempts(), 0);

    let producer = MessageProducer::new(supervisor, "entity_queue");
    assert!(producer.publish(&Event::deleted(1)).await.is_err());
}

#[tokio::test]
#[ignore] // Ignore by default as it requires a running RabbitMQ instance
async fn test_live_broker_publish() {
    let mut settings = AppConfig::default();
    EnvOverrides::load().unwrap().apply(&mut settings);
    let queue = format!("entity_events_test_{}", uuid::Uuid::new_v4().simple());

    let supervisor = Arc::new(
        ConnectionSupervisor::new(Arc::new(RabbitMqClient::new(
            settings.amqp_uri().unwrap(),
            settings.connect_timeout(),
        )))
        .with_backoff(LinearBackoff::new(Duration::from_millis(200), 1)),
    );
    let registrar = QueueRegistrar::new(supervisor.clone(), QueueCachePolicy::default());
    let declared = registrar.declare_queue(&queue, false).await.unwrap();
    assert_eq!(declared.message_count, 0);

    MessageProducer::new(supervisor.clone(), &queue)
        .publish(&Event::deleted(1))
        .await
        .unwrap();
    supervisor.close().await.unwrap();
}
