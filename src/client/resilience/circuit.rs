//! Per-scope circuit breakers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CircuitConfig {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the breaker.
    pub success_threshold: u32,
    /// How long an open breaker rejects before admitting a trial.
    pub open_duration: Duration,
    /// Failure percentage over a filled window that opens a closed breaker.
    pub failure_rate_threshold: f64,
    pub sliding_window_size: usize,
    /// Caps concurrent trials while half-open. `None` admits every call.
    pub half_open_max_calls: Option<u32>,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(30),
            failure_rate_threshold: 50.0,
            sliding_window_size: 10,
            half_open_max_calls: None,
        }
    }
}

impl CircuitConfig {
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    pub fn failure_rate_threshold(mut self, percent: f64) -> Self {
        self.failure_rate_threshold = percent;
        self
    }

    pub fn sliding_window_size(mut self, size: usize) -> Self {
        self.sliding_window_size = size;
        self
    }

    pub fn half_open_max_calls(mut self, max: u32) -> Self {
        self.half_open_max_calls = Some(max);
        self
    }
}

struct Inner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    half_open_in_flight: u32,
    last_failure: Option<Instant>,
    window: Vec<bool>,
    window_index: usize,
    window_filled: bool,
}

impl Inner {
    fn record_outcome(&mut self, success: bool) {
        self.window[self.window_index] = success;
        self.window_index = (self.window_index + 1) % self.window.len();
        if self.window_index == 0 {
            self.window_filled = true;
        }
    }

    fn failure_rate(&self) -> Option<f64> {
        if !self.window_filled {
            return None;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        Some(failures as f64 / self.window.len() as f64 * 100.0)
    }

    fn release_trial(&mut self) {
        self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
    }
}

/// Failure tracking for a single scope.
///
/// Callers check [`allow`](Self::allow) before every attempt and report the attempt's
/// outcome through exactly one of [`record_success`](Self::record_success),
/// [`record_failure`](Self::record_failure) or [`record_neutral`](Self::record_neutral).
pub struct CircuitBreaker {
    scope: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(scope: impl Into<String>, config: CircuitConfig) -> Self {
        let window_size = config.sliding_window_size.max(1);
        Self {
            scope: scope.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                half_open_in_flight: 0,
                last_failure: None,
                window: vec![true; window_size],
                window_index: 0,
                window_filled: false,
            }),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    /// Whether an attempt may proceed. An open breaker whose open duration has elapsed
    /// moves to half-open and admits this call as a trial.
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed < self.config.open_duration {
                    return false;
                }
                inner.state = CircuitState::HalfOpen;
                inner.successes = 0;
                inner.half_open_in_flight = 1;
                tracing::info!(scope = %self.scope, "Circuit breaker half-open");
                true
            }
            CircuitState::HalfOpen => match self.config.half_open_max_calls {
                Some(max) if inner.half_open_in_flight >= max => false,
                _ => {
                    inner.half_open_in_flight += 1;
                    true
                }
            },
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.record_outcome(true);
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen => {
                inner.release_trial();
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.half_open_in_flight = 0;
                    tracing::info!(scope = %self.scope, "Circuit breaker closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.last_failure = Some(Instant::now());
        inner.record_outcome(false);
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                let rate = inner.failure_rate();
                let rate_tripped = rate.is_some_and(|r| r >= self.config.failure_rate_threshold);
                if inner.failures >= self.config.failure_threshold || rate_tripped {
                    inner.state = CircuitState::Open;
                    tracing::warn!(
                        scope = %self.scope,
                        failures = inner.failures,
                        failure_rate = rate.unwrap_or_default(),
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.successes = 0;
                inner.half_open_in_flight = 0;
                tracing::warn!(scope = %self.scope, "Circuit breaker reopened after failed trial");
            }
            CircuitState::Open => {}
        }
    }

    /// Report an attempt whose outcome says nothing about backend health, such as a 404 or
    /// a caller cancellation. Only frees a half-open trial slot.
    pub fn record_neutral(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.release_trial();
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.successes = 0;
        inner.half_open_in_flight = 0;
        tracing::info!(scope = %self.scope, "Circuit breaker reset");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("scope", &self.scope)
            .field("state", &self.state())
            .finish()
    }
}

/// Lazily created breakers keyed by scope. Breakers for different scopes never share a
/// lock.
#[derive(Debug)]
pub struct CircuitRegistry {
    config: CircuitConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, scope: &str) -> Arc<CircuitBreaker> {
        if let Some(cb) = self.breakers.get(scope) {
            return Arc::clone(cb.value());
        }

        let entry = self
            .breakers
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(scope, self.config.clone())));
        Arc::clone(entry.value())
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CircuitRegistry {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}
