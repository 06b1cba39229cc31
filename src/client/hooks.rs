//! Observability callbacks around operations, HTTP attempts and retries.
//!
//! Two levels are reported:
//! - operation level: one logical call through the [`Executor`](super::Executor), however
//!   many attempts it takes
//! - request level: each HTTP round trip made by the [`Client`](super::Client)
//!
//! Every method has a no-op default, so implementors override only what they need.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::RequestKind;
use crate::{Error, Result};

/// One logical call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationInfo {
    pub scope: String,
    pub kind: RequestKind,
}

impl OperationInfo {
    pub fn new(scope: impl Into<String>, kind: RequestKind) -> Self {
        Self {
            scope: scope.into(),
            kind,
        }
    }

    pub fn is_mutation(&self) -> bool {
        self.kind.is_mutation()
    }
}

/// One HTTP attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestInfo {
    pub method: String,
    pub url: String,
    /// 1-based.
    pub attempt: u32,
}

/// Outcome of one HTTP attempt.
#[derive(Debug)]
pub struct RequestResult<'a> {
    /// `None` when the attempt failed before a response arrived.
    pub status: Option<u16>,
    pub duration: Duration,
    pub error: Option<&'a Error>,
    pub from_cache: bool,
    /// Whether the executor may try again after this failure.
    pub retryable: bool,
}

#[async_trait]
pub trait RequestHooks: Send + Sync {
    /// Runs before any admission check. An error rejects the operation without
    /// starting it.
    async fn on_operation_gate(&self, _op: &OperationInfo) -> Result<()> {
        Ok(())
    }

    async fn on_operation_start(&self, _op: &OperationInfo) {}

    async fn on_operation_end(
        &self,
        _op: &OperationInfo,
        _error: Option<&Error>,
        _elapsed: Duration,
    ) {
    }

    async fn on_request_start(&self, _info: &RequestInfo) {}

    async fn on_request_end(&self, _info: &RequestInfo, _result: &RequestResult<'_>) {}

    /// Called before waiting out `delay` ahead of attempt number `attempt`.
    async fn on_retry(
        &self,
        _op: &OperationInfo,
        _attempt: u32,
        _delay: Duration,
        _error: &Error,
    ) {
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHooks;

#[async_trait]
impl RequestHooks for NoopHooks {}

/// Runs several hook sets. Start events and gates run in order, end events in reverse
/// order so that spans nest.
#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Vec<Arc<dyn RequestHooks>>,
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, hooks: impl RequestHooks + 'static) -> Self {
        self.hooks.push(Arc::new(hooks));
        self
    }

    pub fn push(&mut self, hooks: Arc<dyn RequestHooks>) {
        self.hooks.push(hooks);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl std::fmt::Debug for HookChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookChain")
            .field("len", &self.hooks.len())
            .finish()
    }
}

#[async_trait]
impl RequestHooks for HookChain {
    /// The first rejecting gate wins; later gates are not consulted.
    async fn on_operation_gate(&self, op: &OperationInfo) -> Result<()> {
        for hooks in &self.hooks {
            hooks.on_operation_gate(op).await?;
        }
        Ok(())
    }

    async fn on_operation_start(&self, op: &OperationInfo) {
        for hooks in &self.hooks {
            hooks.on_operation_start(op).await;
        }
    }

    async fn on_operation_end(
        &self,
        op: &OperationInfo,
        error: Option<&Error>,
        elapsed: Duration,
    ) {
        for hooks in self.hooks.iter().rev() {
            hooks.on_operation_end(op, error, elapsed).await;
        }
    }

    async fn on_request_start(&self, info: &RequestInfo) {
        for hooks in &self.hooks {
            hooks.on_request_start(info).await;
        }
    }

    async fn on_request_end(&self, info: &RequestInfo, result: &RequestResult<'_>) {
        for hooks in self.hooks.iter().rev() {
            hooks.on_request_end(info, result).await;
        }
    }

    async fn on_retry(&self, op: &OperationInfo, attempt: u32, delay: Duration, error: &Error) {
        for hooks in &self.hooks {
            hooks.on_retry(op, attempt, delay, error).await;
        }
    }
}
