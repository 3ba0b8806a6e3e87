//! Backoff schedule for reconnection attempts

use std::time::Duration;

use wicket_core::config::BackoffConfig;

/// Jittered exponential backoff over a gate's retry attempts.
///
/// The delay for attempt `n` is `initial * multiplier^n`, capped at `max`,
/// plus a random jitter of up to `jitter * delay` so clients losing the
/// same network do not reconnect in lockstep.
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a schedule from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            config: config.clone(),
            attempt: 0,
        }
    }

    /// Delay before the next attempt, advancing the schedule
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.config.multiplier.powi(self.attempt as i32);
        let base = self.config.initial.as_secs_f64() * exponent;
        let capped = base.min(self.config.max.as_secs_f64());
        self.attempt = self.attempt.saturating_add(1);

        let jitter = capped * self.config.jitter * rand::random::<f64>();
        Duration::from_secs_f64(capped + jitter)
    }

    /// Attempts taken so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Restart the schedule from the initial delay
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
