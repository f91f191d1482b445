//! Bounded exponential backoff for retrying conflicting commits

use crate::config::RetryConfig;
use std::time::Duration;

/// Upper bound on a single backoff delay
const MAX_DELAY_MS: u64 = 2_000;

/// Exponential backoff with a fixed attempt budget
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay_ms: u64,
    max_attempts: u32,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a backoff allowing `max_attempts` retries
    pub fn new(base_delay_ms: u64, max_attempts: u32) -> Self {
        ExponentialBackoff {
            base_delay_ms,
            max_attempts,
            attempt: 0,
        }
    }

    /// Build from the retry section of the config
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.base_delay_ms, config.max_attempts)
    }

    /// Delay before the next attempt, or None once the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u64 << self.attempt.min(16);
        self.attempt += 1;
        let ms = self.base_delay_ms.saturating_mul(factor).min(MAX_DELAY_MS);
        Some(Duration::from_millis(ms))
    }

    /// Retries consumed so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
