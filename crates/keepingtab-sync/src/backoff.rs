//! Capped exponential backoff.
//!
//! Delay for retry `n` (1-based) is `base * 2^(n-1)`, capped at `max`.
//! Jitter shaves a random fraction off the delay so workers that failed
//! together do not retry in lockstep; it never pushes a delay above `max`.

use std::time::Duration;

use rand::Rng;

/// Backoff schedule for one kind of retry.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
    /// Fraction of the delay that may be randomly removed, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy without jitter.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Set the jitter fraction, clamped to `[0, 1]`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_nan() {
            0.0
        } else {
            jitter.clamp(0.0, 1.0)
        };
        self
    }

    /// Deterministic delay before retry `retry` (1-based). Zero for zero.
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let shift = retry.saturating_sub(1);
        let multiplier = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(multiplier).min(max_ms);

        Duration::from_millis(delay_ms)
    }

    /// Delay before retry `retry` with jitter applied.
    pub fn jittered(&self, retry: u32) -> Duration {
        let delay = self.delay(retry);
        let spread_ms = (delay.as_millis() as f64 * self.jitter) as u64;
        if spread_ms == 0 {
            return delay;
        }

        let cut = rand::thread_rng().gen_range(0..=spread_ms);
        delay.saturating_sub(Duration::from_millis(cut))
    }
}
