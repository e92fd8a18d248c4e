//! Retry budget and exponential backoff with jitter for delivery attempts.

use std::time::Duration;

use rand::Rng;

/// Retry policy for a single delivery item.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Send attempts per item, including the first.
    pub max_attempts: u32,

    /// Delay after the first failed attempt; doubles per attempt.
    pub base_delay: Duration,

    /// Upper bound for any backoff delay.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) applied to each backoff delay.
    pub jitter_factor: f64,

    /// Longest flood wait a worker will sleep through in place.
    pub max_flood_sleep: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.1,
            max_flood_sleep: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempts` have been spent.
    pub fn has_attempts_left(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Backoff before the attempt following failed attempt number `attempt`
    /// (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let base = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(exponent));
        let capped = base.min(self.max_delay);
        apply_jitter(capped, self.jitter_factor).min(self.max_delay)
    }

    /// How long to sleep for a server-mandated flood wait.
    pub fn flood_sleep(&self, wait: Duration) -> Duration {
        wait.min(self.max_flood_sleep)
    }

    /// Pause after a flood error on attempt `attempt`: the (bounded) server
    /// wait, but never less than the regular backoff for that attempt.
    pub fn flood_delay(&self, wait: Duration, attempt: u32) -> Duration {
        self.flood_sleep(wait).max(self.backoff(attempt))
    }
}

/// Randomize `duration` by ±`jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let jitter_range = duration.as_secs_f64() * jitter_factor.clamp(0.0, 1.0);
    let offset = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}
