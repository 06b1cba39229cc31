//! # rampart
//!
//! Resilient request execution for rate-limited, occasionally unavailable REST backends.
//!
//! A single logical call flows through one pipeline: a per-scope bulkhead bounds
//! concurrency, a per-scope circuit breaker fails fast while a scope is unhealthy, a
//! credential manager keeps the bearer token fresh, a conditional cache revalidates reads
//! cheaply, and the executor retries classified transient failures with backoff.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rampart::{CallContext, Client, StaticTokenProvider};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), rampart::Error> {
//!     let client = Client::builder()
//!         .base_url("https://api.example.com")
//!         .account_id("42")
//!         .token_provider(StaticTokenProvider::new("token"))
//!         .build()?;
//!
//!     let ctx = CallContext::with_timeout(std::time::Duration::from_secs(30));
//!     let response = client.get(&ctx, "projects.list", "projects.json").await?;
//!     println!("{} bytes (cached: {})", response.body.len(), response.from_cache);
//!     Ok(())
//! }
//! ```
//!
//! ## Executing custom attempts
//!
//! ```rust,no_run
//! use rampart::{CallContext, Executor, RequestKind, ResilienceConfig};
//!
//! # async fn example() -> Result<(), rampart::Error> {
//! let executor = Executor::new(ResilienceConfig::default());
//! let ctx = CallContext::new();
//! let value = executor
//!     .execute(&ctx, "reports", RequestKind::Read, |_attempt| async { Ok(42) })
//!     .await?;
//! # let _ = value;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod auth;
pub mod client;
pub mod config;
pub mod prelude;

mod persist;

use std::time::Duration;

pub use auth::{
    AuthManager, Credential, CredentialStore, FileStorage, MemoryStorage, StaticTokenProvider,
    TokenProvider, default_store, origin_of,
};
pub use client::{
    AttemptContext, BulkheadConfig, BulkheadPermit, BulkheadRegistry, CallContext, CircuitBreaker,
    CircuitConfig, CircuitRegistry, CircuitState, Client, ClientBuilder, ConditionalCache,
    Executor, ExponentialBackoff, HookChain, MAX_RETRY_AFTER, NoopHooks, OperationInfo,
    RateLimitConfig, RateLimiter, RequestHooks, RequestInfo, RequestKind, RequestResult,
    ResilienceConfig, Response, RetryConfig, parse_retry_after,
};
pub use config::{AuthConfig, BodyLimits, ClientConfig};

/// Error type for rampart operations.
///
/// Classification happens once, where the raw response is inspected. Everything above
/// that boundary works with these variants and their [`ErrorKind`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Caller misconfiguration. Never retried.
    #[error("Usage error: {0}")]
    Usage(String),

    /// Authentication required or rejected (HTTP 401, missing or unrefreshable credential).
    #[error("Authentication failed: {message}")]
    Auth { message: String },

    /// Access denied (HTTP 403).
    #[error("Access denied: {message}{}", hint.as_ref().map(|h| format!(" ({})", h)).unwrap_or_default())]
    Forbidden {
        message: String,
        hint: Option<String>,
    },

    /// Resource not found (HTTP 404).
    #[error("Not found: {0}")]
    NotFound(String),

    /// Server-side rate limit (HTTP 429).
    #[error("Rate limit exceeded{}", match retry_after {
        Some(d) => format!(", retry in {:.0}s", d.as_secs_f64()),
        None => String::new(),
    })]
    RateLimit { retry_after: Option<Duration> },

    /// Connection, DNS, TLS or transport timeout failure.
    #[error("Network request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// Internal server failure (HTTP 500 and other non-gateway 5xx).
    #[error("Server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    /// Gateway-class unavailability (HTTP 502, 503, 504).
    #[error("Gateway error (HTTP {status})")]
    Gateway {
        status: u16,
        retry_after: Option<Duration>,
    },

    /// Any other unsuccessful response.
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// The scope's bulkhead had no free slot within its wait bound.
    #[error("Overloaded: bulkhead for scope '{scope}' is full")]
    BulkheadFull { scope: String },

    /// The scope's circuit breaker is open.
    #[error("Unhealthy: circuit breaker for scope '{scope}' is open")]
    CircuitOpen { scope: String },

    /// The client-side rate limiter refused the call.
    #[error("Throttled by client-side rate limiter{}", match retry_after {
        Some(d) => format!(", blocked for {:.0}s", d.as_secs_f64()),
        None => String::new(),
    })]
    Throttled { retry_after: Option<Duration> },

    /// Every attempt of a retryable call failed.
    #[error("Request failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// A response body exceeded its byte ceiling.
    #[error("Response body exceeds {limit} byte limit")]
    SizeLimitExceeded { limit: u64 },

    /// The caller cancelled the call context.
    #[error("Operation cancelled by caller")]
    Cancelled,

    /// The caller's deadline passed.
    #[error("Caller deadline exceeded")]
    DeadlineExceeded,

    /// JSON serialization or deserialization failed.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// File system operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Typed classification of an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Usage,
    Authentication,
    Forbidden,
    NotFound,
    RateLimited,
    Network,
    ServerError,
    GatewayError,
    Other,
    /// Admission refused by a bulkhead, circuit breaker or rate limiter.
    Rejected,
    Exhausted,
    SizeLimit,
    Cancelled,
    Internal,
}

impl Error {
    pub fn auth(message: impl Into<String>) -> Self {
        Error::Auth {
            message: message.into(),
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Error::Usage(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Usage(_) | Error::Config(_) => ErrorKind::Usage,
            Error::Auth { .. } => ErrorKind::Authentication,
            Error::Forbidden { .. } => ErrorKind::Forbidden,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::RateLimit { .. } => ErrorKind::RateLimited,
            Error::Network(_) => ErrorKind::Network,
            Error::Server { .. } => ErrorKind::ServerError,
            Error::Gateway { .. } => ErrorKind::GatewayError,
            Error::Api { .. } => ErrorKind::Other,
            Error::BulkheadFull { .. } | Error::CircuitOpen { .. } | Error::Throttled { .. } => {
                ErrorKind::Rejected
            }
            Error::RetriesExhausted { .. } => ErrorKind::Exhausted,
            Error::SizeLimitExceeded { .. } => ErrorKind::SizeLimit,
            Error::Cancelled | Error::DeadlineExceeded => ErrorKind::Cancelled,
            Error::Json(_) | Error::Io(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimited
                | ErrorKind::Network
                | ErrorKind::ServerError
                | ErrorKind::GatewayError
        )
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::Auth { .. })
    }

    pub fn is_rejection(&self) -> bool {
        self.kind() == ErrorKind::Rejected
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /// Whether the outcome counts against a circuit breaker.
    ///
    /// Only server-side trouble counts. Client errors, admission rejections and caller
    /// cancellation say nothing about the health of the backend.
    pub fn trips_circuit(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Server { .. } | Error::Gateway { .. }
        )
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Forbidden { .. } => Some(403),
            Error::NotFound(_) => Some(404),
            Error::RateLimit { .. } => Some(429),
            Error::Server { status, .. }
            | Error::Gateway { status, .. }
            | Error::Api { status, .. } => Some(*status),
            Error::RetriesExhausted { source, .. } => source.status_code(),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimit { retry_after }
            | Error::Gateway { retry_after, .. }
            | Error::Throttled { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Result type alias for rampart operations.
pub type Result<T> = std::result::Result<T, Error>;
