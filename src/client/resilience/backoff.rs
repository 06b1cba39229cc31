//! Exponential backoff strategy for retry policies.

use std::time::Duration;

/// `base * factor^(attempt-1)`, capped at `max`, plus uniform jitter in `[0, max_jitter)`.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    factor: f64,
    max_jitter: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration, factor: f64) -> Self {
        Self {
            base,
            max,
            factor,
            max_jitter: Duration::from_millis(100),
        }
    }

    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max_jitter(&self) -> Duration {
        self.max_jitter
    }

    /// Delay before retrying after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp =
            self.base.as_millis() as f64 * self.factor.powi(attempt.saturating_sub(1) as i32);
        let clamped = exp.min(self.max.as_millis() as f64).max(0.0);

        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            rand::random_range(0..jitter_ms)
        } else {
            0
        };

        Duration::from_millis(clamped as u64 + jitter)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            factor: 2.0,
            max_jitter: Duration::from_millis(100),
        }
    }
}
