// End-to-end: producer -> memory broker -> consumer -> dispatcher -> store

use async_trait::async_trait;
use entity_events::dispatch::{EventDispatcher, EventHandler, Outcome};
use entity_events::message::{EntityFields, Event, Gender};
use entity_events::rabbitmq::{
    ConnectionSupervisor, ConsumerConfig, Disposition, MemoryBroker, MessageConsumer,
    MessageProducer, QueueCachePolicy, QueueRegistrar, Subscription,
};
use entity_events::store::{Entity, EntityStore, InMemoryStore, StoreError, UniqueConflict};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const QUEUE: &str = "entity_queue";

/// Counts writes on top of the in-memory store.
#[derive(Default)]
struct CountingStore {
    inner: InMemoryStore,
    creates: AtomicUsize,
    deletes: AtomicUsize,
}

#[async_trait]
impl EntityStore for CountingStore {
    async fn find_conflict(&self, fields: &EntityFields) -> Result<Option<UniqueConflict>, StoreError> {
        self.inner.find_conflict(fields).await
    }

    async fn create(&self, fields: EntityFields) -> Result<Entity, StoreError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create(fields).await
    }

    async fn update(&self, id: i64, fields: EntityFields) -> Result<u64, StoreError> {
        self.inner.update(id, fields).await
    }

    async fn delete(&self, id: i64) -> Result<u64, StoreError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(id).await
    }

    async fn get(&self, id: i64) -> Result<Option<Entity>, StoreError> {
        self.inner.get(id).await
    }
}

struct Harness {
    broker: MemoryBroker,
    supervisor: Arc<ConnectionSupervisor>,
    producer: MessageProducer,
    store: Arc<CountingStore>,
    subscription: Subscription,
}

impl Harness {
    async fn start(concurrency: usize) -> Self {
        let broker = MemoryBroker::new();
        let supervisor = Arc::new(ConnectionSupervisor::new(Arc::new(broker.clone())));
        let registrar = Arc::new(QueueRegistrar::new(
            supervisor.clone(),
            QueueCachePolicy::default(),
        ));
        registrar.declare_queue(QUEUE, true).await.unwrap();

        let store = Arc::new(CountingStore::default());
        let dispatcher = Arc::new(EventDispatcher::new(store.clone()));
        let consumer = MessageConsumer::new(
            supervisor.clone(),
            registrar,
            ConsumerConfig {
                concurrency,
                ..ConsumerConfig::default()
            },
        );
        let subscription = consumer.subscribe(QUEUE, dispatcher).await.unwrap();

        Self {
            producer: MessageProducer::new(supervisor.clone(), QUEUE),
            broker,
            supervisor,
            store,
            subscription,
        }
    }

    async fn settled(&self, count: usize) -> Vec<Disposition> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let dispositions = self.broker.dispositions();
                if dispositions.len() >= count {
                    return dispositions.into_iter().map(|(_, d)| d).collect();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("messages were not settled in time")
    }

    async fn shutdown(self) {
        self.supervisor.close().await.unwrap();
        self.subscription.join().await.unwrap();
    }
}

fn alice() -> EntityFields {
    EntityFields::new("alice", "pw")
        .with_email("alice@example.com")
        .with_phone("555-0100")
        .with_gender(Gender::Female)
}

const DROPPED: Disposition = Disposition::Nacked { requeue: false };

#[tokio::test]
async fn test_unique_create_is_acked_and_stored() {
    let harness = Harness::start(1).await;

    harness.producer.publish(&Event::created(alice())).await.unwrap();

    assert_eq!(harness.settled(1).await, vec![Disposition::Acked]);
    assert_eq!(harness.store.creates.load(Ordering::SeqCst), 1);
    assert_eq!(harness.store.inner.len().await, 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_username_is_dropped() {
    let harness = Harness::start(1).await;

    harness.producer.publish(&Event::created(alice())).await.unwrap();
    let duplicate = EntityFields::new("alice", "other").with_email("second@example.com");
    harness.producer.publish(&Event::created(duplicate)).await.unwrap();

    assert_eq!(harness.settled(2).await, vec![Disposition::Acked, DROPPED]);
    assert_eq!(harness.store.creates.load(Ordering::SeqCst), 1);
    assert_eq!(harness.broker.queue_depth(QUEUE), Some(0));
    harness.shutdown().await;
}

#[tokio::test]
async fn test_malformed_body_never_reaches_the_store() {
    let harness = Harness::start(1).await;

    harness.broker.inject(QUEUE, "not json at all").unwrap();
    harness
        .broker
        .inject(QUEUE, r#"{"event_type": "entity.renamed", "data": {}}"#)
        .unwrap();

    assert_eq!(harness.settled(2).await, vec![DROPPED, DROPPED]);
    assert_eq!(harness.subscription.stats().decode_failures, 2);
    assert_eq!(harness.store.creates.load(Ordering::SeqCst), 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_update_of_missing_entity_is_dropped() {
    let harness = Harness::start(1).await;

    harness.producer.publish(&Event::updated(99, alice())).await.unwrap();

    assert_eq!(harness.settled(1).await, vec![DROPPED]);
    assert!(harness.store.inner.is_empty().await);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_create_then_delete_end_to_end() {
    let harness = Harness::start(1).await;

    harness.producer.publish(&Event::created(alice())).await.unwrap();
    harness.producer.publish(&Event::deleted(1)).await.unwrap();

    assert_eq!(
        harness.settled(2).await,
        vec![Disposition::Acked, Disposition::Acked]
    );
    assert_eq!(harness.store.deletes.load(Ordering::SeqCst), 1);
    assert!(harness.store.inner.is_empty().await);

    let stats = harness.subscription.stats();
    assert_eq!((stats.received, stats.acked, stats.nacked), (2, 2, 0));
    harness.shutdown().await;
}

#[tokio::test]
async fn test_store_outage_drops_message() {
    let harness = Harness::start(1).await;
    harness.store.inner.set_available(false);

    harness.producer.publish(&Event::created(alice())).await.unwrap();

    assert_eq!(harness.settled(1).await, vec![DROPPED]);
    assert_eq!(harness.broker.queue_depth(QUEUE), Some(0));
    harness.shutdown().await;
}

#[tokio::test]
async fn test_consumer_survives_connection_loss() {
    let harness = Harness::start(1).await;

    harness.producer.publish(&Event::created(alice())).await.unwrap();
    harness.settled(1).await;

    harness.broker.drop_connections();
    harness.producer.publish(&Event::deleted(1)).await.unwrap();

    assert_eq!(
        harness.settled(2).await,
        vec![Disposition::Acked, Disposition::Acked]
    );
    assert!(harness.store.inner.is_empty().await);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_every_message_settled_once_with_concurrency() {
    let harness = Harness::start(4).await;

    for i in 0..40 {
        let fields = EntityFields::new(format!("user{}", i), "pw");
        harness.producer.publish(&Event::created(fields)).await.unwrap();
    }
    harness.settled(40).await;

    let dispositions = harness.broker.dispositions();
    let tags: HashSet<u64> = dispositions.iter().map(|(tag, _)| *tag).collect();
    assert_eq!(dispositions.len(), 40);
    assert_eq!(tags.len(), 40);
    assert!(dispositions.iter().all(|(_, d)| *d == Disposition::Acked));
    assert_eq!(harness.store.inner.len().await, 40);
    harness.shutdown().await;
}

/// Signals when it starts, then holds the message until released.
struct Gate {
    started: Notify,
    release: Notify,
}

#[async_trait]
impl EventHandler for Gate {
    async fn handle(&self, _event: Event) -> Outcome {
        self.started.notify_one();
        self.release.notified().await;
        Outcome::Success
    }
}

#[tokio::test]
async fn test_close_waits_for_in_flight_message() {
    let broker = MemoryBroker::new();
    let supervisor = Arc::new(ConnectionSupervisor::new(Arc::new(broker.clone())));
    let registrar = Arc::new(QueueRegistrar::new(
        supervisor.clone(),
        QueueCachePolicy::default(),
    ));
    let gate = Arc::new(Gate {
        started: Notify::new(),
        release: Notify::new(),
    });
    let consumer = MessageConsumer::new(supervisor.clone(), registrar, ConsumerConfig::default());
    let subscription = consumer.subscribe(QUEUE, gate.clone()).await.unwrap();

    broker.inject(QUEUE, Event::deleted(1).to_bytes().unwrap()).unwrap();
    gate.started.notified().await;

    let closing = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.close().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!closing.is_finished());
    assert!(broker.dispositions().is_empty());

    gate.release.notify_one();
    closing.await.unwrap().unwrap();

    assert_eq!(broker.dispositions().len(), 1);
    assert_eq!(broker.dispositions()[0].1, Disposition::Acked);
    subscription.join().await.unwrap();
}
