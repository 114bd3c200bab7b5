//! Retry discipline shared by the live send path and the buffer sweeper.

use std::time::Duration;

use rand::Rng;

/// Bounded exponential backoff with jitter.
///
/// One policy value is evaluated by both consumers: the live send path
/// walks attempts 0..max_retries sleeping `delay_for(attempt)` between
/// them; the background sweeper makes a single attempt per cycle, its
/// period acting as the backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts on the live path before the payload is buffered.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Sleep before retrying after `failed_attempts` failures (1-based:
    /// the first retry passes 1). Doubles each time, ±10 % jitter, never
    /// above `max_delay`.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * 2f64.powi(failed_attempts.saturating_sub(1) as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.1 * (rand::thread_rng().gen::<f64>() - 0.5);
        Duration::from_secs_f64((capped + jitter).clamp(0.0, self.max_delay.as_secs_f64()))
    }
}
