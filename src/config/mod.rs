//! Client configuration.
//!
//! ```rust,no_run
//! use rampart::ClientConfig;
//!
//! # fn example() -> Result<(), rampart::Error> {
//! let config = ClientConfig::from_env()?;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

pub mod env;

use std::path::PathBuf;
use std::time::Duration;

use crate::auth::require_secure_endpoint;
use crate::client::{ConditionalCache, ResilienceConfig};
use crate::{Error, Result};

pub use env::ENV_PREFIX;
use env::EnvSource;

/// Credential refresh settings.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Refresh once the credential is this close to expiry.
    pub refresh_buffer: Duration,
    /// Ceiling on the token endpoint's response body.
    pub max_refresh_body_bytes: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_buffer: Duration::from_secs(300),
            max_refresh_body_bytes: 1024 * 1024,
        }
    }
}

/// Response body ceilings.
#[derive(Clone, Debug)]
pub struct BodyLimits {
    pub max_response_bytes: u64,
    pub max_error_bytes: u64,
    pub max_error_message_bytes: usize,
    pub max_cache_body_bytes: u64,
}

impl Default for BodyLimits {
    fn default() -> Self {
        Self {
            max_response_bytes: 50 * 1024 * 1024,
            max_error_bytes: 1024 * 1024,
            max_error_message_bytes: 500,
            max_cache_body_bytes: 50 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub base_url: String,
    /// Tenant prefix for relative paths (`/{account_id}/{path}`).
    pub account_id: Option<String>,
    pub user_agent: String,
    /// Per-attempt HTTP timeout.
    pub timeout: Duration,
    pub cache_dir: Option<PathBuf>,
    pub cache_enabled: bool,
    pub resilience: ResilienceConfig,
    pub auth: AuthConfig,
    pub limits: BodyLimits,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            account_id: None,
            user_agent: format!("rampart/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
            cache_dir: ConditionalCache::default_dir(),
            cache_enabled: false,
            resilience: ResilienceConfig::default(),
            auth: AuthConfig::default(),
            limits: BodyLimits::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Defaults overlaid with `RAMPART_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvSource::new(lookup);
        let mut config = Self::default();

        if let Some(url) = env.string("BASE_URL") {
            config.base_url = url;
        }
        if let Some(account) = env.string("ACCOUNT_ID") {
            config.account_id = Some(account);
        }
        if let Some(dir) = env.string("CACHE_DIR") {
            config.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(enabled) = env.bool("CACHE_ENABLED")? {
            config.cache_enabled = enabled;
        }
        if let Some(timeout) = env.secs("TIMEOUT_SECS")? {
            config.timeout = timeout;
        }

        let retry = &mut config.resilience.retry;
        if let Some(attempts) = env.parse::<u32>("MAX_RETRIES")? {
            retry.max_attempts = attempts;
        }
        if let Some(base) = env.millis("BASE_DELAY_MS")? {
            retry.backoff = retry.backoff.clone().with_base(base);
        }
        if let Some(jitter) = env.millis("MAX_JITTER_MS")? {
            retry.backoff = retry.backoff.clone().with_max_jitter(jitter);
        }

        let max_concurrent = env.parse::<usize>("BULKHEAD_MAX_CONCURRENT")?;
        let max_wait = env.millis("BULKHEAD_MAX_WAIT_MS")?;
        if max_concurrent.is_some() || max_wait.is_some() {
            let bulkhead = config.resilience.bulkhead.get_or_insert_with(Default::default);
            if let Some(max) = max_concurrent {
                bulkhead.max_concurrent = max;
            }
            if let Some(wait) = max_wait {
                bulkhead.max_wait = wait;
            }
        }

        let threshold = env.parse::<u32>("CIRCUIT_FAILURE_THRESHOLD")?;
        let rate = env.parse::<f64>("CIRCUIT_FAILURE_RATE")?;
        let window = env.parse::<usize>("CIRCUIT_WINDOW")?;
        let open = env.secs("CIRCUIT_OPEN_SECS")?;
        if threshold.is_some() || rate.is_some() || window.is_some() || open.is_some() {
            let circuit = config.resilience.circuit.get_or_insert_with(Default::default);
            if let Some(threshold) = threshold {
                circuit.failure_threshold = threshold;
            }
            if let Some(rate) = rate {
                circuit.failure_rate_threshold = rate;
            }
            if let Some(window) = window {
                circuit.sliding_window_size = window;
            }
            if let Some(open) = open {
                circuit.open_duration = open;
            }
        }

        if let Some(buffer) = env.secs("REFRESH_BUFFER_SECS")? {
            config.auth.refresh_buffer = buffer;
        }
        if let Some(max) = env.parse::<u64>("MAX_REFRESH_BYTES")? {
            config.auth.max_refresh_body_bytes = max;
        }
        if let Some(max) = env.parse::<u64>("MAX_CACHE_BODY_BYTES")? {
            config.limits.max_cache_body_bytes = max;
        }

        Ok(config)
    }

    pub fn account_id(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn cache(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self.cache_enabled = true;
        self
    }

    pub fn resilience(mut self, resilience: ResilienceConfig) -> Self {
        self.resilience = resilience;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            return Err(Error::Config("base URL is required".into()));
        }
        require_secure_endpoint(&self.base_url)
            .map_err(|e| Error::Config(format!("base URL: {}", e)))?;

        if self.timeout.is_zero() {
            return Err(Error::Config("timeout must be positive".into()));
        }
        if self.cache_enabled && self.cache_dir.is_none() {
            return Err(Error::Config(
                "cache is enabled but no cache directory is available".into(),
            ));
        }

        let resilience = &self.resilience;
        if resilience.retry.max_attempts == 0 {
            return Err(Error::Config("max attempts must be at least 1".into()));
        }
        if let Some(bulkhead) = &resilience.bulkhead
            && bulkhead.max_concurrent == 0
        {
            return Err(Error::Config(
                "bulkhead capacity must be at least 1".into(),
            ));
        }
        if let Some(circuit) = &resilience.circuit {
            if circuit.sliding_window_size == 0 {
                return Err(Error::Config(
                    "circuit sliding window must be at least 1".into(),
                ));
            }
            if !(circuit.failure_rate_threshold > 0.0 && circuit.failure_rate_threshold <= 100.0)
            {
                return Err(Error::Config(format!(
                    "circuit failure rate must be in (0, 100], got {}",
                    circuit.failure_rate_threshold
                )));
            }
            if circuit.failure_threshold == 0 || circuit.success_threshold == 0 {
                return Err(Error::Config(
                    "circuit thresholds must be at least 1".into(),
                ));
            }
        }
        if let Some(rate_limit) = &resilience.rate_limit
            && rate_limit.requests_per_second <= 0.0
        {
            return Err(Error::Config(
                "requests per second must be positive".into(),
            ));
        }
        Ok(())
    }
}
