//! Relay Reconnect Backoff
//!
//! Exponential backoff with a ceiling. The default policy retries forever so
//! a tunnel survives relay restarts and network blips.

use std::time::Duration;

/// Reconnect policy for relay connections
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_interval: Duration,

    /// Growth factor per attempt
    pub multiplier: f64,

    /// Upper bound for any single delay
    pub max_interval: Duration,

    /// `None` retries without limit
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(250),
            multiplier: 2.0,
            max_interval: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn with_backoff(mut self, initial: Duration, multiplier: f64, max: Duration) -> Self {
        self.initial_interval = initial;
        self.multiplier = multiplier;
        self.max_interval = max;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay to wait after `attempt` consecutive failures (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms = (self.initial_interval.as_millis() as f64 * self.multiplier.powi(exponent))
            .min(self.max_interval.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// Whether another attempt is allowed after `attempts` failures
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}
