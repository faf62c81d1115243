use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential reconnect delay with optional jitter and attempt cap.
///
/// Each failure doubles (by `multiplier`) the wait up to `max_delay_ms`.
/// `reset()` after a successful connect starts over from `initial_delay_ms`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    failures: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Record a failed attempt and return how long to wait before the next
    /// one, or `None` once `max_attempts` consecutive failures are reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if let Some(max) = self.config.max_attempts {
            if self.failures >= max {
                return None;
            }
        }

        let max_ms = self.config.max_delay_ms as f64;
        let exponent = (self.failures - 1).min(64) as i32;
        let base = (self.config.initial_delay_ms as f64 * self.config.multiplier.max(1.0).powi(exponent)).min(max_ms);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let delay = if jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
            (base * factor).min(max_ms)
        } else {
            base
        };
        Some(Duration::from_millis(delay as u64))
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
