//! Orchestration of one logical call across attempts.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::{
    Bulkhead, BulkheadRegistry, CircuitBreaker, CircuitRegistry, RateLimiter, ResilienceConfig,
};
use crate::auth::TokenProvider;
use crate::client::CallContext;
use crate::client::hooks::{NoopHooks, OperationInfo, RequestHooks};
use crate::{Error, Result};

const DEFAULT_RATE_LIMIT_BLOCK: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// Idempotent; keeps the full retry budget.
    Read,
    /// Create, update or delete. Only retried once, after a credential refresh.
    Mutation,
}

impl RequestKind {
    pub fn is_mutation(self) -> bool {
        self == RequestKind::Mutation
    }
}

/// Passed to every attempt of a logical call.
#[derive(Clone)]
pub struct AttemptContext {
    /// 1-based.
    pub attempt: u32,
    pub scope: String,
    pub kind: RequestKind,
    /// Bearer token fetched for this attempt when the executor has a token provider.
    pub access_token: Option<String>,
}

impl std::fmt::Debug for AttemptContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptContext")
            .field("attempt", &self.attempt)
            .field("scope", &self.scope)
            .field("kind", &self.kind)
            .field("access_token", &self.access_token.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

pub struct Executor {
    config: ResilienceConfig,
    circuits: Option<CircuitRegistry>,
    bulkheads: Option<BulkheadRegistry>,
    rate_limiter: Option<RateLimiter>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    hooks: Arc<dyn RequestHooks>,
}

impl Executor {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            circuits: config.circuit.clone().map(CircuitRegistry::new),
            bulkheads: config.bulkhead.clone().map(BulkheadRegistry::new),
            rate_limiter: config.rate_limit.clone().map(RateLimiter::new),
            token_provider: None,
            hooks: Arc::new(NoopHooks),
            config,
        }
    }

    /// Provider asked for a token before every attempt, and refreshed once when the
    /// first attempt comes back unauthorized.
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn RequestHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn hooks(&self) -> &Arc<dyn RequestHooks> {
        &self.hooks
    }

    pub fn circuit(&self, scope: &str) -> Option<Arc<CircuitBreaker>> {
        self.circuits.as_ref().map(|r| r.get(scope))
    }

    pub fn bulkhead(&self, scope: &str) -> Option<Arc<Bulkhead>> {
        self.bulkheads.as_ref().map(|r| r.get(scope))
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    /// Run `attempt_fn` until it succeeds, fails with a non-retryable error, or the retry
    /// budget runs out.
    ///
    /// Hook gates run first. The bulkhead slot is then held for the whole call. The
    /// breaker and rate limiter are consulted before each attempt, and their rejections
    /// are returned to the caller rather than retried.
    pub async fn execute<T, F, Fut>(
        &self,
        ctx: &CallContext,
        scope: &str,
        kind: RequestKind,
        attempt_fn: F,
    ) -> Result<T>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let op = OperationInfo::new(scope, kind);
        self.hooks.on_operation_gate(&op).await?;
        self.hooks.on_operation_start(&op).await;

        let started = Instant::now();
        let result = self.run(ctx, &op, attempt_fn).await;
        self.hooks
            .on_operation_end(&op, result.as_ref().err(), started.elapsed())
            .await;
        result
    }

    async fn run<T, F, Fut>(
        &self,
        ctx: &CallContext,
        op: &OperationInfo,
        mut attempt_fn: F,
    ) -> Result<T>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let scope = op.scope.as_str();
        let kind = op.kind;
        let _permit = match self.bulkhead(scope) {
            Some(bulkhead) => Some(bulkhead.acquire(ctx).await?),
            None => None,
        };
        let breaker = self.circuit(scope);

        let mut budget = match kind {
            RequestKind::Read => self.config.retry.max_attempts.max(1),
            RequestKind::Mutation => 1,
        };
        let mut refreshed = false;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if let Some(err) = ctx.err() {
                return Err(err);
            }

            if let Some(cb) = &breaker
                && !cb.allow()
            {
                tracing::debug!(scope, attempt, "Circuit open, rejecting call");
                return Err(Error::CircuitOpen {
                    scope: scope.to_string(),
                });
            }

            if let Err(err) = self.admit(ctx, attempt).await {
                if let Some(cb) = &breaker {
                    cb.record_neutral();
                }
                return Err(err);
            }

            tracing::debug!(scope, attempt, ?kind, "Executing attempt");
            let mut used_token = None;
            let outcome = ctx
                .run(async {
                    let access_token = match &self.token_provider {
                        Some(provider) => Some(provider.access_token(ctx).await?),
                        None => None,
                    };
                    used_token.clone_from(&access_token);
                    attempt_fn(AttemptContext {
                        attempt,
                        scope: scope.to_string(),
                        kind,
                        access_token,
                    })
                    .await
                })
                .await
                .and_then(|r| r);

            let err = match outcome {
                Ok(value) => {
                    if let Some(cb) = &breaker {
                        cb.record_success();
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if let Some(cb) = &breaker {
                if err.trips_circuit() {
                    cb.record_failure();
                } else {
                    cb.record_neutral();
                }
            }
            self.note_server_hint(&err);

            if err.is_unauthorized()
                && attempt == 1
                && !refreshed
                && let Some(provider) = self
                    .token_provider
                    .as_ref()
                    .filter(|p| p.supports_refresh())
            {
                refreshed = true;
                let refresh = match used_token.as_deref() {
                    Some(rejected) => provider.refresh_rejected(ctx, rejected).await,
                    None => provider.refresh(ctx).await,
                };
                match refresh {
                    Ok(()) => {
                        tracing::debug!(scope, "Credential refreshed, retrying once");
                        budget += 1;
                        self.hooks
                            .on_retry(op, attempt + 1, Duration::ZERO, &err)
                            .await;
                        continue;
                    }
                    Err(refresh_err) if refresh_err.is_cancellation() => return Err(refresh_err),
                    Err(refresh_err) => {
                        tracing::warn!(scope, error = %refresh_err, "Credential refresh failed");
                        return Err(err);
                    }
                }
            }

            if !err.is_retryable() || kind.is_mutation() {
                return Err(err);
            }
            if attempt >= budget {
                if attempt == 1 {
                    return Err(err);
                }
                tracing::warn!(scope, attempts = attempt, error = %err, "Retries exhausted");
                return Err(Error::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = self.delay_for(attempt, &err);
            tracing::debug!(scope, attempt, ?delay, error = %err, "Retrying after failure");
            self.hooks.on_retry(op, attempt + 1, delay, &err).await;
            ctx.sleep(delay).await?;
        }
    }

    /// First attempts fail fast on the rate limiter; retries already committed to waiting
    /// queue on it instead.
    async fn admit(&self, ctx: &CallContext, attempt: u32) -> Result<()> {
        let Some(limiter) = &self.rate_limiter else {
            return Ok(());
        };
        if attempt > 1 {
            return limiter.wait(ctx).await;
        }
        if limiter.allow() {
            return Ok(());
        }
        let remaining = limiter.retry_after_remaining();
        Err(Error::Throttled {
            retry_after: (!remaining.is_zero()).then_some(remaining),
        })
    }

    fn note_server_hint(&self, err: &Error) {
        let Some(limiter) = &self.rate_limiter else {
            return;
        };
        match err {
            Error::RateLimit { retry_after } => {
                limiter.set_retry_after(retry_after.unwrap_or(DEFAULT_RATE_LIMIT_BLOCK));
            }
            Error::Gateway {
                status: 503,
                retry_after: Some(hint),
            } => limiter.set_retry_after(*hint),
            _ => {}
        }
    }

    fn delay_for(&self, attempt: u32, err: &Error) -> Duration {
        match err.retry_after() {
            Some(hint) if self.config.retry.honor_retry_after => hint,
            _ => self.config.retry.backoff.delay_for(attempt),
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field(
                "token_provider",
                &self.token_provider.as_ref().map(|p| p.name().to_string()),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::client::resilience::{
        BulkheadConfig, CircuitConfig, CircuitState, ExponentialBackoff, RateLimitConfig,
        RetryConfig,
    };

    fn config() -> ResilienceConfig {
        ResilienceConfig::default().retry(
            RetryConfig::default().max_attempts(3).backoff(
                ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60), 2.0)
                    .with_max_jitter(Duration::ZERO),
            ),
        )
    }

    fn gateway() -> Error {
        Error::Gateway {
            status: 503,
            retry_after: None,
        }
    }

    struct CountingProvider {
        refreshes: AtomicU32,
    }

    #[async_trait]
    impl TokenProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }

        async fn access_token(&self, _ctx: &CallContext) -> Result<String> {
            Ok("token".into())
        }

        fn supports_refresh(&self) -> bool {
            true
        }

        async fn refresh(&self, _ctx: &CallContext) -> Result<()> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let executor = Executor::new(config());
        let value = executor
            .execute(&CallContext::new(), "todos", RequestKind::Read, |a| async move {
                assert_eq!(a.attempt, 1);
                assert_eq!(a.scope, "todos");
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_retries_until_budget_exhausted() {
        let executor = Executor::new(config().circuit(None));
        let calls = AtomicU32::new(0);

        let start = Instant::now();
        let err = executor
            .execute(&CallContext::new(), "todos", RequestKind::Read, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(gateway()) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
        // 1s + 2s of backoff
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_millis(3050));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_then_success() {
        let executor = Executor::new(config());
        let calls = AtomicU32::new(0);

        let value = executor
            .execute(&CallContext::new(), "todos", RequestKind::Read, |a| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if a.attempt < 3 {
                        Err(gateway())
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_returns_immediately() {
        let executor = Executor::new(config());
        let calls = AtomicU32::new(0);

        let err = executor
            .execute(&CallContext::new(), "todos", RequestKind::Read, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::NotFound("/todos/1".into())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mutation_is_not_retried() {
        let executor = Executor::new(config());
        let calls = AtomicU32::new(0);

        let err = executor
            .execute(&CallContext::new(), "todos", RequestKind::Mutation, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(gateway()) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Gateway { status: 503, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_refreshes_once_then_retries() {
        let provider = Arc::new(CountingProvider {
            refreshes: AtomicU32::new(0),
        });
        let executor = Executor::new(config()).with_token_provider(provider.clone());

        for kind in [RequestKind::Read, RequestKind::Mutation] {
            let value = executor
                .execute(&CallContext::new(), "todos", kind, |a| async move {
                    if a.attempt == 1 {
                        Err(Error::auth("token expired"))
                    } else {
                        Ok(a.attempt)
                    }
                })
                .await
                .unwrap();
            assert_eq!(value, 2);
        }
        assert_eq!(provider.refreshes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_repeated_unauthorized_refreshes_only_once() {
        let provider = Arc::new(CountingProvider {
            refreshes: AtomicU32::new(0),
        });
        let executor = Executor::new(config()).with_token_provider(provider.clone());
        let calls = AtomicU32::new(0);

        let err = executor
            .execute(&CallContext::new(), "todos", RequestKind::Read, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::auth("revoked")) }
            })
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_keeps_full_read_budget() {
        let provider = Arc::new(CountingProvider {
            refreshes: AtomicU32::new(0),
        });
        let executor = Executor::new(config().circuit(None)).with_token_provider(provider);
        let calls = AtomicU32::new(0);

        let err = executor
            .execute(&CallContext::new(), "todos", RequestKind::Read, |a| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if a.attempt == 1 {
                        Err::<(), _>(Error::auth("expired"))
                    } else {
                        Err(gateway())
                    }
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 4, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_overrides_backoff() {
        let executor = Executor::new(config());
        let start = Instant::now();
        executor
            .execute(&CallContext::new(), "todos", RequestKind::Read, |a| async move {
                if a.attempt == 1 {
                    Err(Error::RateLimit {
                        retry_after: Some(Duration::from_secs(7)),
                    })
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(7) && elapsed < Duration::from_millis(7050));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_used_when_retry_after_not_honored() {
        let mut cfg = config();
        cfg.retry.honor_retry_after = false;
        let executor = Executor::new(cfg);

        let start = Instant::now();
        executor
            .execute(&CallContext::new(), "todos", RequestKind::Read, |a| async move {
                if a.attempt == 1 {
                    Err(Error::RateLimit {
                        retry_after: Some(Duration::from_secs(7)),
                    })
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_millis(1050));
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_without_attempting() {
        let executor = Executor::new(
            config()
                .retry(RetryConfig::default().max_attempts(1))
                .circuit(CircuitConfig::default().failure_threshold(2)),
        );
        let ctx = CallContext::new();

        for _ in 0..2 {
            let _ = executor
                .execute(&ctx, "todos", RequestKind::Read, |_| async {
                    Err::<(), _>(gateway())
                })
                .await;
        }
        assert_eq!(
            executor.circuit("todos").unwrap().state(),
            CircuitState::Open
        );

        let calls = AtomicU32::new(0);
        let err = executor
            .execute(&ctx, "todos", RequestKind::Read, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Other scopes are unaffected.
        executor
            .execute(&ctx, "people", RequestKind::Read, |_| async { Ok(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_client_errors_do_not_trip_circuit() {
        let executor =
            Executor::new(config().circuit(CircuitConfig::default().failure_threshold(1)));
        let _ = executor
            .execute(&CallContext::new(), "todos", RequestKind::Read, |_| async {
                Err::<(), _>(Error::NotFound("x".into()))
            })
            .await;
        assert_eq!(
            executor.circuit("todos").unwrap().state(),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_full_bulkhead_rejects() {
        let executor = Executor::new(
            config().bulkhead(
                BulkheadConfig::default()
                    .max_concurrent(1)
                    .max_wait(Duration::ZERO),
            ),
        );
        let _held = executor.bulkhead("todos").unwrap().try_acquire().unwrap();

        let err = executor
            .execute(&CallContext::new(), "todos", RequestKind::Read, |_| async {
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BulkheadFull { .. }));
    }

    #[tokio::test]
    async fn test_bulkhead_slot_released_after_call() {
        let executor = Executor::new(config());
        let _ = executor
            .execute(&CallContext::new(), "todos", RequestKind::Read, |_| async {
                Err::<(), _>(Error::NotFound("x".into()))
            })
            .await;
        let bulkhead = executor.bulkhead("todos").unwrap();
        assert_eq!(bulkhead.in_use(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let executor = Arc::new(Executor::new(config()));
        let ctx = CallContext::new();

        let handle = {
            let executor = Arc::clone(&executor);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                executor
                    .execute(&ctx, "todos", RequestKind::Read, |_| async {
                        Err::<(), _>(gateway())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        ctx.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(executor.bulkhead("todos").unwrap().in_use(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_response_blocks_limiter() {
        let executor = Executor::new(
            config()
                .retry(RetryConfig::default().max_attempts(1))
                .rate_limit(RateLimitConfig::default()),
        );
        let ctx = CallContext::new();

        let _ = executor
            .execute(&ctx, "todos", RequestKind::Read, |_| async {
                Err::<(), _>(Error::RateLimit { retry_after: None })
            })
            .await;

        let err = executor
            .execute(&ctx, "todos", RequestKind::Read, |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Throttled { retry_after: Some(d) } if d == Duration::from_secs(60)));
    }

    #[derive(Default)]
    struct RetryRecorder {
        retries: std::sync::Mutex<Vec<(u32, Duration, Option<u16>)>>,
        ended: AtomicU32,
    }

    #[async_trait]
    impl RequestHooks for RetryRecorder {
        async fn on_operation_end(&self, _op: &OperationInfo, _e: Option<&Error>, _d: Duration) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_retry(&self, op: &OperationInfo, attempt: u32, delay: Duration, err: &Error) {
            assert_eq!(op.scope, "todos");
            self.retries
                .lock()
                .unwrap()
                .push((attempt, delay, err.status_code()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_hook_fires_once_per_retry() {
        let hooks = Arc::new(RetryRecorder::default());
        let executor = Executor::new(config().circuit(None)).with_hooks(hooks.clone());

        let value = executor
            .execute(&CallContext::new(), "todos", RequestKind::Read, |a| async move {
                if a.attempt < 3 {
                    Err(gateway())
                } else {
                    Ok(a.attempt)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 3);

        assert_eq!(
            *hooks.retries.lock().unwrap(),
            vec![
                (2, Duration::from_secs(1), Some(503)),
                (3, Duration::from_secs(2), Some(503)),
            ]
        );
        assert_eq!(hooks.ended.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_retry_hook_for_first_attempt_success() {
        let hooks = Arc::new(RetryRecorder::default());
        let executor = Executor::new(config()).with_hooks(hooks.clone());
        executor
            .execute(&CallContext::new(), "todos", RequestKind::Read, |_| async { Ok(()) })
            .await
            .unwrap();
        assert!(hooks.retries.lock().unwrap().is_empty());
        assert_eq!(hooks.ended.load(Ordering::SeqCst), 1);
    }

    struct ClosedGate;

    #[async_trait]
    impl RequestHooks for ClosedGate {
        async fn on_operation_gate(&self, op: &OperationInfo) -> Result<()> {
            Err(Error::CircuitOpen {
                scope: op.scope.clone(),
            })
        }
    }

    #[tokio::test]
    async fn test_gate_rejection_skips_attempts_and_bulkhead() {
        let executor = Executor::new(config()).with_hooks(Arc::new(ClosedGate));
        let calls = AtomicU32::new(0);

        let err = executor
            .execute(&CallContext::new(), "todos", RequestKind::Read, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(executor.bulkhead("todos").unwrap().in_use(), 0);
    }

    #[tokio::test]
    async fn test_attempt_receives_provider_token() {
        let provider = Arc::new(CountingProvider {
            refreshes: AtomicU32::new(0),
        });
        let executor = Executor::new(config()).with_token_provider(provider);
        let token = executor
            .execute(&CallContext::new(), "todos", RequestKind::Read, |a| async move {
                Ok(a.access_token)
            })
            .await
            .unwrap();
        assert_eq!(token.as_deref(), Some("token"));
    }
}
