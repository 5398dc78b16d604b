use anyhow::{Context, Result};
use dotenv::dotenv;
use std::env;
use std::str::FromStr;

use crate::config::AppConfig;

/// Deployment overrides read from the environment (and `.env`), applied on top
/// of the config file.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EnvOverrides {
    pub amqp_addr: Option<String>,
    pub queue: Option<String>,
    pub prefetch_count: Option<u16>,
    pub max_retries: Option<u32>,
    pub connect_timeout_seconds: Option<u64>,
    pub concurrency: Option<usize>,
}

impl EnvOverrides {
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(EnvOverrides {
            amqp_addr: lookup("AMQP_ADDR").filter(|addr| !addr.is_empty()),
            queue: lookup("ENTITY_QUEUE").filter(|queue| !queue.is_empty()),
            prefetch_count: parse(&lookup, "RABBITMQ_PREFETCH_COUNT")?,
            max_retries: parse(&lookup, "RABBITMQ_MAX_RETRIES")?,
            connect_timeout_seconds: parse(&lookup, "RABBITMQ_CONNECT_TIMEOUT_SECONDS")?,
            concurrency: parse(&lookup, "RABBITMQ_CONCURRENCY")?,
        })
    }

    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(addr) = &self.amqp_addr {
            config.broker.uri = Some(addr.clone());
        }
        if let Some(queue) = &self.queue {
            config.queue.name = queue.clone();
        }
        if let Some(prefetch) = self.prefetch_count {
            config.queue.prefetch_count = prefetch;
        }
        if let Some(max_retries) = self.max_retries {
            config.retry.max_retries = max_retries;
        }
        if let Some(seconds) = self.connect_timeout_seconds {
            config.broker.connection_timeout_ms = seconds.saturating_mul(1000);
        }
        if let Some(concurrency) = self.concurrency {
            config.queue.concurrency = concurrency;
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{} has an invalid value: {:?}", key, raw)),
        None => Ok(None),
    }
}
