// src/rabbitmq/backoff.rs
//! Reconnect backoff policies for the connection supervisor.

use std::time::Duration;

/// Decides how many times a failed connection attempt is retried and how long
/// to wait before each retry.
pub trait BackoffPolicy: Send + Sync + std::fmt::Debug {
    /// Number of retries after the first attempt.
    fn max_retries(&self) -> u32;

    /// Wait before retry number `attempt` (1-based: the wait after the first failure is `delay(1)`).
    fn delay(&self, attempt: u32) -> Duration;
}

/// `wait = attempt × base`, the policy used for broker reconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearBackoff {
    pub base: Duration,
    pub max_retries: u32,
}

impl LinearBackoff {
    pub fn new(base: Duration, max_retries: u32) -> Self {
        Self { base, max_retries }
    }
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max_retries: 10,
        }
    }
}

impl BackoffPolicy for LinearBackoff {
    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = LinearBackoff::default();
        assert_eq!(policy.max_retries(), 10);
        let waits: Vec<u64> = (1..=5).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(waits, vec![2, 4, 6, 8, 10]);
    }

    #[test]
    fn test_custom_base() {
        let policy = LinearBackoff::new(Duration::from_millis(250), 3);
        assert_eq!(policy.delay(3), Duration::from_millis(750));
        assert_eq!(policy.max_retries(), 3);
    }
}
