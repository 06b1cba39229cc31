//! Client-side token bucket with server-driven blocking.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::Result;
use crate::client::CallContext;

/// Upper bound on a server-imposed block when the requested one cannot be represented.
const MAX_BLOCK: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst_size: u32,
    /// Block admissions while a server `Retry-After` hint is pending.
    pub respect_retry_after: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 50.0,
            burst_size: 10,
            respect_retry_after: true,
        }
    }
}

impl RateLimitConfig {
    pub fn requests_per_second(mut self, rps: f64) -> Self {
        self.requests_per_second = rps;
        self
    }

    pub fn burst_size(mut self, burst: u32) -> Self {
        self.burst_size = burst;
        self
    }

    pub fn respect_retry_after(mut self, respect: bool) -> Self {
        self.respect_retry_after = respect;
        self
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
}

impl Bucket {
    fn refill(&mut self, rate: f64, burst: f64) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * rate).min(burst);
    }

    /// Remaining server-imposed block, clearing it once elapsed.
    fn blocked_for(&mut self) -> Option<Duration> {
        let until = self.blocked_until?;
        let now = Instant::now();
        if now < until {
            Some(until - now)
        } else {
            self.blocked_until = None;
            None
        }
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let config = RateLimitConfig {
            requests_per_second: if config.requests_per_second > 0.0 {
                config.requests_per_second
            } else {
                RateLimitConfig::default().requests_per_second
            },
            burst_size: config.burst_size.max(1),
            ..config
        };
        Self {
            bucket: Mutex::new(Bucket {
                tokens: config.burst_size as f64,
                last_refill: Instant::now(),
                blocked_until: None,
            }),
            config,
        }
    }

    /// Take a token without waiting.
    pub fn allow(&self) -> bool {
        let mut bucket = self.lock();
        if self.config.respect_retry_after && bucket.blocked_for().is_some() {
            return false;
        }
        bucket.refill(self.rate(), self.burst());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait for a token, honoring any pending server block and the caller's context.
    pub async fn wait(&self, ctx: &CallContext) -> Result<()> {
        loop {
            let delay = {
                let mut bucket = self.lock();
                match bucket.blocked_for().filter(|_| self.config.respect_retry_after) {
                    Some(blocked) => blocked,
                    None => {
                        bucket.refill(self.rate(), self.burst());
                        if bucket.tokens >= 1.0 {
                            bucket.tokens -= 1.0;
                            return Ok(());
                        }
                        let needed = 1.0 - bucket.tokens;
                        Duration::from_secs_f64(needed / self.rate()) + Duration::from_millis(1)
                    }
                }
            };
            ctx.sleep(delay).await?;
        }
    }

    /// Block admissions for `duration`. A shorter hint never shortens an existing block.
    pub fn set_retry_after(&self, duration: Duration) {
        if !self.config.respect_retry_after {
            return;
        }
        let until = far_deadline(duration);
        let mut bucket = self.lock();
        if bucket.blocked_until.is_none_or(|current| until > current) {
            bucket.blocked_until = Some(until);
            tracing::debug!(retry_after = ?duration, "Rate limiter blocked by server hint");
        }
    }

    pub fn tokens(&self) -> f64 {
        let mut bucket = self.lock();
        bucket.refill(self.rate(), self.burst());
        bucket.tokens
    }

    pub fn retry_after_remaining(&self) -> Duration {
        let bucket = self.lock();
        bucket
            .blocked_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .unwrap_or_default()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn rate(&self) -> f64 {
        self.config.requests_per_second
    }

    fn burst(&self) -> f64 {
        self.config.burst_size as f64
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `now + duration`, saturating instead of overflowing the clock.
fn far_deadline(duration: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(duration)
        .or_else(|| now.checked_add(MAX_BLOCK))
        .unwrap_or(now)
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
