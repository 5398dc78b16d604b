// src/config.rs
use std::path::{Path, PathBuf};
use std::fs;
use std::time::Duration;
use anyhow::{Result, Context, anyhow};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPUri, AMQPUserInfo};
use serde::{Deserialize, Serialize};
use tracing::{info, debug};

use crate::rabbitmq::{ChannelConfig, ConsumerConfig, LinearBackoff, QueueCachePolicy};

pub const CONFIG_FILE_NAME: &str = "entity-events.json";

/// `broker.uri` value that selects the in-process broker.
pub const MEMORY_BROKER_URI: &str = "memory://";

// Configuration structures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub channel: ChannelSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,
    /// Full AMQP URI; when set it wins over the individual fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default = "default_timeout")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default = "default_prefetch")]
    pub prefetch_count: u16,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub cache_policy: QueueCachePolicy,
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSettings {
    #[serde(default = "default_true")]
    pub confirm_mode: bool,
}

// Default values
fn default_host() -> String { "localhost".to_string() }
fn default_port() -> u16 { 5672 }
fn default_username() -> String { "guest".to_string() }
fn default_password() -> String { "guest".to_string() }
fn default_virtual_host() -> String { "/".to_string() }
fn default_timeout() -> u64 { 5000 }
fn default_heartbeat() -> u16 { 30 }
fn default_max_retries() -> u32 { 10 }
fn default_base_delay() -> u64 { 2 }
fn default_queue_name() -> String { "entity_queue".to_string() }
fn default_true() -> bool { true }
fn default_prefetch() -> u16 { 10 }
fn default_concurrency() -> usize { 1 }
fn default_publish_timeout() -> u64 { 30_000 }

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: default_username(),
            password: default_password(),
            virtual_host: default_virtual_host(),
            uri: None,
            connection_timeout_ms: default_timeout(),
            heartbeat_seconds: default_heartbeat(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            durable: true,
            prefetch_count: default_prefetch(),
            concurrency: default_concurrency(),
            cache_policy: QueueCachePolicy::default(),
            publish_timeout_ms: default_publish_timeout(),
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self { confirm_mode: true }
    }
}

impl AppConfig {
    fn explicit_uri(&self) -> Option<&str> {
        self.broker.uri.as_deref().filter(|uri| !uri.is_empty())
    }

    pub fn uses_memory_broker(&self) -> bool {
        self.explicit_uri()
            .is_some_and(|uri| uri.starts_with(MEMORY_BROKER_URI))
    }

    /// The broker target: `broker.uri` if given, otherwise built from parts.
    /// Credentials and vhost are carried raw; lapin encodes them on the wire.
    pub fn amqp_uri(&self) -> Result<AMQPUri> {
        if let Some(uri) = self.explicit_uri() {
            return uri
                .parse::<AMQPUri>()
                .map_err(|e| anyhow!("Configuration error: invalid broker.uri: {}", e));
        }

        let broker = &self.broker;
        Ok(AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: broker.username.clone(),
                    password: broker.password.clone(),
                },
                host: broker.host.clone(),
                port: broker.port,
            },
            vhost: broker.virtual_host.clone(),
            query: AMQPQueryString {
                heartbeat: Some(broker.heartbeat_seconds),
                ..AMQPQueryString::default()
            },
            ..AMQPUri::default()
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.broker.connection_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.queue.publish_timeout_ms)
    }

    pub fn backoff(&self) -> LinearBackoff {
        LinearBackoff::new(
            Duration::from_secs(self.retry.base_delay_secs),
            self.retry.max_retries,
        )
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            prefetch_count: self.queue.prefetch_count,
            confirm_mode: self.channel.confirm_mode,
            ..ChannelConfig::default()
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            durable: self.queue.durable,
            concurrency: self.queue.concurrency,
            ..ConsumerConfig::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.name.is_empty() {
            return Err(anyhow!("Configuration error: queue.name cannot be empty"));
        }
        if self.queue.concurrency == 0 {
            return Err(anyhow!("Configuration error: queue.concurrency must be at least 1"));
        }
        if self.uses_memory_broker() {
            return Ok(());
        }
        if self.explicit_uri().is_none() && self.broker.host.is_empty() {
            return Err(anyhow!("Configuration error: broker.host cannot be empty"));
        }
        self.amqp_uri().map(|_| ())
    }
}

// Configuration loading and management functions
pub fn find_config_file() -> Option<PathBuf> {
    // Check various locations
    let local = Path::new(CONFIG_FILE_NAME).to_path_buf();
    let nested = Path::new("config").join(CONFIG_FILE_NAME);
    let locations = [("Current directory", local), ("Config directory", nested)];

    for (location_name, path) in locations {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Some(path);
        }
    }

    // Try the user's home directory
    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Some(home_config);
        }
    }

    None
}

pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let config_content = fs::read_to_string(path)
        .context(format!("Failed to read config file at {}", path.display()))?;

    // Parse and validate the config structure
    let config: AppConfig = serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON or mistyped fields")?;
    config.validate()?;

    Ok(config)
}

/// The discovered config file, or the built-in defaults when there is none.
pub fn load_config() -> Result<AppConfig> {
    match find_config_file() {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            load_config_from(&path)
        }
        None => {
            info!("No {} found, using defaults", CONFIG_FILE_NAME);
            Ok(AppConfig::default())
        }
    }
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&AppConfig::default())
        .context("Failed to serialize default configuration")?;

    // Create parent directories if they don't exist
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .context(format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());

    println!("\nConfiguration file created at: {}", path.display());
    println!("\nThis file contains default settings for a local RabbitMQ node.");
    println!("\nKey settings to review:");
    println!("  - broker.host / broker.username / broker.password - Update if RabbitMQ is not running locally");
    println!("  - broker.virtual_host - The vhost the queue lives in");
    println!("  - queue.concurrency - Keep at 1 to process events in broker order");

    Ok(())
}
