use anyhow::{anyhow, Context, Result};
use entity_events::config::{self, AppConfig, CONFIG_FILE_NAME};
use entity_events::dispatch::EventDispatcher;
use entity_events::env::EnvOverrides;
use entity_events::message::Event;
use entity_events::rabbitmq::{
    AmqpConnector, ConnectionSupervisor, MemoryBroker, MessageConsumer, MessageProducer,
    QueueRegistrar, RabbitMqClient,
};
use entity_events::store::InMemoryStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("init-config") => {
            let path = args
                .get(1)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
            config::create_default_config_file(&path)
        }
        Some("publish") => {
            let file = args
                .get(1)
                .ok_or_else(|| anyhow!("usage: entity-events publish <event.json>"))?;
            publish_file(load_settings()?, Path::new(file)).await
        }
        Some(other) => Err(anyhow!(
            "unknown command '{}' (expected init-config or publish)",
            other
        )),
        None => run_worker(load_settings()?).await,
    }
}

fn load_settings() -> Result<AppConfig> {
    let mut settings = config::load_config()?;
    EnvOverrides::load()?.apply(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn build_supervisor(settings: &AppConfig) -> Result<Arc<ConnectionSupervisor>> {
    let connector: Arc<dyn AmqpConnector> = if settings.uses_memory_broker() {
        Arc::new(MemoryBroker::new())
    } else {
        Arc::new(RabbitMqClient::new(
            settings.amqp_uri()?,
            settings.connect_timeout(),
        ))
    };
    Ok(Arc::new(
        ConnectionSupervisor::new(connector)
            .with_backoff(settings.backoff())
            .with_channel_config(settings.channel_config()),
    ))
}

async fn run_worker(settings: AppConfig) -> Result<()> {
    let supervisor = build_supervisor(&settings)?;
    let registrar = Arc::new(QueueRegistrar::new(
        supervisor.clone(),
        settings.queue.cache_policy,
    ));

    let queue = registrar
        .declare_queue(&settings.queue.name, settings.queue.durable)
        .await
        .context("Failed to declare the event queue")?;
    info!(
        queue = %queue.name,
        messages = queue.message_count,
        consumers = queue.consumer_count,
        "Event queue ready"
    );

    let dispatcher = Arc::new(EventDispatcher::new(Arc::new(InMemoryStore::new())));
    let consumer = MessageConsumer::new(supervisor.clone(), registrar, settings.consumer_config());
    let subscription = consumer
        .subscribe(&settings.queue.name, dispatcher)
        .await
        .context("Failed to start consuming")?;

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Shutdown requested");
        }
        _ = subscription.stopped() => {
            error!("Consumer stopped unexpectedly");
        }
    }

    supervisor.close().await?;
    let stats = subscription.stats();
    subscription.join().await?;
    info!(
        received = stats.received,
        acked = stats.acked,
        nacked = stats.nacked,
        decode_failures = stats.decode_failures,
        "Worker exited"
    );
    Ok(())
}

async fn publish_file(settings: AppConfig, file: &Path) -> Result<()> {
    let body = std::fs::read(file).context(format!("Failed to read {}", file.display()))?;
    let event = Event::from_slice(&body).context("File is not a valid event document")?;

    let supervisor = build_supervisor(&settings)?;
    // Make sure the queue exists before the first publish
    QueueRegistrar::new(supervisor.clone(), settings.queue.cache_policy)
        .declare_queue(&settings.queue.name, settings.queue.durable)
        .await?;

    let producer = MessageProducer::new(supervisor.clone(), &settings.queue.name)
        .with_timeout(settings.publish_timeout());
    let published = producer.publish(&event).await;
    supervisor.close().await?;
    published?;

    println!("Published {} to {}", event.event_type(), producer.queue());
    Ok(())
}
