//! Prelude module for convenient imports.
//!
//! ```rust
//! use rampart::prelude::*;
//! ```

// Core types
pub use crate::Error;
pub use crate::ErrorKind;
pub use crate::Result;

// Client
pub use crate::client::{CallContext, Client, ClientBuilder, Response};

// Observability
pub use crate::client::{HookChain, OperationInfo, RequestHooks, RequestInfo, RequestResult};

// Resilience
pub use crate::client::{
    BulkheadConfig, CircuitConfig, CircuitState, Executor, ExponentialBackoff, RateLimitConfig,
    RequestKind, ResilienceConfig, RetryConfig,
};

// Authentication
pub use crate::auth::{AuthManager, Credential, CredentialStore, StaticTokenProvider, TokenProvider};

// Configuration
pub use crate::config::ClientConfig;
