//! Retry backoff
//!
//! Exponential with jitter, computed with the `backoff` crate so the delay
//! before retry `n` follows the same curve a reconnect loop would.

use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};

/// Retry schedule for failed jobs
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Randomization factor in [0, 1]; 0 disables jitter
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let mut backoff = ExponentialBackoff {
            current_interval: self.base_delay,
            initial_interval: self.base_delay,
            max_interval: self.max_delay,
            randomization_factor: self.jitter.clamp(0.0, 1.0),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut delay = self.base_delay;
        for _ in 0..retry.max(1) {
            delay = backoff.next_backoff().unwrap_or(self.max_delay);
        }
        delay.min(self.max_delay)
    }
}
