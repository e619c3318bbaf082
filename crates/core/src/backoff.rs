//! Exponential backoff schedules.
//!
//! Used for the delay between remote polls, for the `retry-wait` delay
//! between worker-assignment attempts, and for the delay between
//! artifact re-uploads.

use std::time::Duration;

/// Tunable parameters for an exponential-backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry (or the first poll).
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each step.
    pub multiplier: f64,
}

impl BackoffConfig {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    ///
    /// `attempt == 0` is treated like the first attempt. The result never
    /// exceeds [`max_delay`](Self::max_delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 1..attempt.max(1) {
            if delay >= self.max_delay {
                break;
            }
            delay = next_delay(delay, self);
        }
        delay
    }
}

impl Default for BackoffConfig {
    /// The poll schedule: 2s doubling up to 30s.
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(30))
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`BackoffConfig::max_delay`] and is never
/// shorter than `current`, even for a multiplier below one.
pub fn next_delay(current: Duration, config: &BackoffConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms)
        .max(current)
        .min(config.max_delay)
}
