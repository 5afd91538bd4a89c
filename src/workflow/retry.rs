//! Backoff policy for failed page attempts.

use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff: `base_delay * multiplier^(attempts - 1)`, capped at
/// `max_delay`, with optional proportional jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,

    pub multiplier: f64,

    /// Upper bound on any single delay, in milliseconds
    pub max_delay_ms: u64,

    /// Fraction of the delay added or removed at random (0.0 disables)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 2000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after `attempts` failed attempts (1-indexed)
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw_ms = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped_ms = raw_ms.min(self.max_delay_ms as f64);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let delay_ms = if jitter > 0.0 && capped_ms > 0.0 {
            let factor = thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
            (capped_ms * factor).min(self.max_delay_ms as f64)
        } else {
            capped_ms
        };

        Duration::from_millis(delay_ms.max(0.0) as u64)
    }
}
