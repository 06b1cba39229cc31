//! Resilience layer: retry with exponential backoff, per-scope circuit breakers and
//! bulkheads, and a client-side rate limiter, composed by the [`Executor`].

mod backoff;
mod bulkhead;
mod circuit;
mod executor;
mod rate_limit;

pub use backoff::ExponentialBackoff;
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadPermit, BulkheadRegistry};
pub use circuit::{CircuitBreaker, CircuitConfig, CircuitRegistry, CircuitState};
pub use executor::{AttemptContext, Executor, RequestKind};
pub use rate_limit::{RateLimitConfig, RateLimiter};

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ResilienceConfig {
    pub retry: RetryConfig,
    pub circuit: Option<CircuitConfig>,
    pub bulkhead: Option<BulkheadConfig>,
    pub rate_limit: Option<RateLimitConfig>,
}

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts for a read, including the first.
    pub max_attempts: u32,
    pub backoff: ExponentialBackoff,
    /// Let a server `Retry-After` hint replace the computed backoff.
    pub honor_retry_after: bool,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            circuit: Some(CircuitConfig::default()),
            bulkhead: Some(BulkheadConfig::default()),
            rate_limit: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: ExponentialBackoff::default(),
            honor_retry_after: true,
        }
    }
}

impl RetryConfig {
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn honor_retry_after(mut self, honor: bool) -> Self {
        self.honor_retry_after = honor;
        self
    }
}

impl ResilienceConfig {
    pub fn no_retry() -> Self {
        Self {
            retry: RetryConfig {
                max_attempts: 1,
                ..Default::default()
            },
            circuit: None,
            bulkhead: None,
            rate_limit: None,
        }
    }

    pub fn aggressive() -> Self {
        Self {
            retry: RetryConfig {
                max_attempts: 6,
                backoff: ExponentialBackoff::new(
                    Duration::from_millis(50),
                    Duration::from_secs(10),
                    2.0,
                ),
                ..Default::default()
            },
            circuit: Some(CircuitConfig {
                failure_threshold: 10,
                open_duration: Duration::from_secs(60),
                success_threshold: 5,
                ..Default::default()
            }),
            bulkhead: Some(BulkheadConfig {
                max_concurrent: 50,
                max_wait: Duration::from_secs(30),
            }),
            rate_limit: None,
        }
    }

    pub fn conservative() -> Self {
        Self {
            retry: RetryConfig {
                max_attempts: 3,
                backoff: ExponentialBackoff::new(
                    Duration::from_millis(500),
                    Duration::from_secs(30),
                    2.0,
                ),
                ..Default::default()
            },
            circuit: Some(CircuitConfig::default()),
            bulkhead: Some(BulkheadConfig {
                max_concurrent: 5,
                max_wait: Duration::ZERO,
            }),
            rate_limit: Some(RateLimitConfig::default()),
        }
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn circuit(mut self, circuit: impl Into<Option<CircuitConfig>>) -> Self {
        self.circuit = circuit.into();
        self
    }

    pub fn bulkhead(mut self, bulkhead: impl Into<Option<BulkheadConfig>>) -> Self {
        self.bulkhead = bulkhead.into();
        self
    }

    pub fn rate_limit(mut self, rate_limit: impl Into<Option<RateLimitConfig>>) -> Self {
        self.rate_limit = rate_limit.into();
        self
    }
}
