//! HTTP client with per-scope resilience.

mod cache;
pub(crate) mod classify;
mod context;
mod hooks;
pub mod resilience;
pub(crate) mod response;

pub use cache::{ConditionalCache, DEFAULT_MAX_CACHE_BODY_BYTES};
pub use classify::{MAX_RETRY_AFTER, parse_retry_after};
pub use context::CallContext;
pub use hooks::{HookChain, NoopHooks, OperationInfo, RequestHooks, RequestInfo, RequestResult};
pub use resilience::{
    AttemptContext, Bulkhead, BulkheadConfig, BulkheadPermit, BulkheadRegistry, CircuitBreaker,
    CircuitConfig, CircuitRegistry, CircuitState, Executor, ExponentialBackoff, RateLimitConfig,
    RateLimiter, RequestKind, ResilienceConfig, RetryConfig,
};
pub use response::Response;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE, ETAG, IF_NONE_MATCH, LINK};
use serde::Serialize;

use crate::auth::{
    AuthManager, CredentialStore, StaticTokenProvider, TokenProvider, origin_of,
    require_secure_endpoint,
};
use crate::config::{BodyLimits, ClientConfig};
use crate::{Error, Result};
use classify::classify_status;
use response::read_limited;

pub const DEFAULT_MAX_PAGES: usize = 10_000;

/// Sends requests relative to a base URL and tenant, routing every call through the
/// [`Executor`].
///
/// Cloning is cheap; clones share breakers, bulkheads, the rate limiter and the cache.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
    token_provider: Arc<dyn TokenProvider>,
    cache: Option<Arc<ConditionalCache>>,
    executor: Arc<Executor>,
    max_pages: usize,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn cache(&self) -> Option<&ConditionalCache> {
        self.cache.as_deref()
    }

    pub async fn get(&self, ctx: &CallContext, scope: &str, path: &str) -> Result<Response> {
        self.request(ctx, scope, Method::GET, path, None).await
    }

    pub async fn post<B: Serialize + ?Sized>(
        &self,
        ctx: &CallContext,
        scope: &str,
        path: &str,
        body: &B,
    ) -> Result<Response> {
        let body = serde_json::to_vec(body)?;
        self.request(ctx, scope, Method::POST, path, Some(body)).await
    }

    pub async fn put<B: Serialize + ?Sized>(
        &self,
        ctx: &CallContext,
        scope: &str,
        path: &str,
        body: &B,
    ) -> Result<Response> {
        let body = serde_json::to_vec(body)?;
        self.request(ctx, scope, Method::PUT, path, Some(body)).await
    }

    pub async fn delete(&self, ctx: &CallContext, scope: &str, path: &str) -> Result<Response> {
        self.request(ctx, scope, Method::DELETE, path, None).await
    }

    /// Fetch a JSON array resource, following `Link: <...>; rel="next"` headers.
    ///
    /// Stops after `limit` items when given. Next-page links must stay on the origin of
    /// the first page.
    pub async fn get_all(
        &self,
        ctx: &CallContext,
        scope: &str,
        path: &str,
        limit: Option<usize>,
    ) -> Result<Vec<serde_json::Value>> {
        let first = self.build_url(path)?;
        let origin = origin_of(&first)?;
        let mut url = first;
        let mut items = Vec::new();
        let mut page = 0;

        loop {
            page += 1;
            let response = self.send(ctx, scope, Method::GET, &url, None).await?;
            items.extend(response.json::<Vec<serde_json::Value>>()?);

            if let Some(limit) = limit
                && items.len() >= limit
            {
                items.truncate(limit);
                break;
            }

            let Some(next) = response.header(LINK.as_str()).and_then(parse_next_link) else {
                break;
            };
            let next = url::Url::parse(&url)
                .and_then(|current| current.join(next))
                .map_err(|e| Error::Usage(format!("invalid pagination link {}: {}", next, e)))?;
            if origin_of(next.as_str())? != origin {
                return Err(Error::Usage(format!(
                    "pagination link points to a different origin: {}",
                    next
                )));
            }
            if page >= self.max_pages {
                tracing::warn!(max_pages = self.max_pages, "Pagination capped");
                break;
            }
            url = next.into();
        }

        Ok(items)
    }

    /// Resolve `path` against the base URL and tenant.
    ///
    /// Absolute `https` URLs pass through unchanged; absolute `http` URLs are only
    /// accepted for loopback hosts.
    pub fn build_url(&self, path: &str) -> Result<String> {
        if path.starts_with("https://") || path.starts_with("http://") {
            require_secure_endpoint(path)?;
            return Ok(path.to_string());
        }

        let base = self.config.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Ok(match self.config.account_id.as_deref() {
            Some(account) => format!("{}/{}/{}", base, account, path),
            None => format!("{}/{}", base, path),
        })
    }

    async fn request(
        &self,
        ctx: &CallContext,
        scope: &str,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Response> {
        let url = self.build_url(path)?;
        self.send(ctx, scope, method, &url, body).await
    }

    async fn send(
        &self,
        ctx: &CallContext,
        scope: &str,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Response> {
        let kind = if method == Method::GET {
            RequestKind::Read
        } else {
            RequestKind::Mutation
        };
        let method = &method;
        let body = body.as_deref();

        self.executor
            .execute(ctx, scope, kind, move |attempt| {
                self.attempt(ctx, attempt, method.clone(), url, body)
            })
            .await
    }

    /// One HTTP round trip, reported to the request hooks. Called by the executor once
    /// per attempt.
    async fn attempt(
        &self,
        ctx: &CallContext,
        attempt: AttemptContext,
        method: Method,
        url: &str,
        body: Option<&[u8]>,
    ) -> Result<Response> {
        let token = match &attempt.access_token {
            Some(token) => token.clone(),
            None => self.token_provider.access_token(ctx).await?,
        };
        let hooks = self.executor.hooks();
        let info = RequestInfo {
            method: method.to_string(),
            url: url.to_string(),
            attempt: attempt.attempt,
        };
        hooks.on_request_start(&info).await;

        let started = tokio::time::Instant::now();
        let result = self.round_trip(&attempt, method, url, body, &token).await;
        let error = result.as_ref().err();
        let outcome = RequestResult {
            status: match &result {
                Ok(response) if response.from_cache => Some(304),
                Ok(response) => Some(response.status),
                Err(err) => err.status_code(),
            },
            duration: started.elapsed(),
            error,
            from_cache: result.as_ref().is_ok_and(|r| r.from_cache),
            retryable: error.is_some_and(|e| e.is_retryable() && !attempt.kind.is_mutation()),
        };
        hooks.on_request_end(&info, &outcome).await;
        result
    }

    async fn round_trip(
        &self,
        attempt: &AttemptContext,
        method: Method,
        url: &str,
        body: Option<&[u8]>,
        token: &str,
    ) -> Result<Response> {
        let limits = &self.config.limits;

        let cached = match &self.cache {
            Some(cache) if method == Method::GET => {
                let tenant = self.config.account_id.as_deref().unwrap_or_default();
                Some((cache, ConditionalCache::key(url, tenant, token)))
            }
            _ => None,
        };

        let mut request = self
            .http
            .request(method.clone(), url)
            .bearer_auth(token)
            .header(ACCEPT, "application/json");
        if let Some(body) = body {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_vec());
        }
        if let Some((cache, key)) = &cached
            && let Some(etag) = cache.get_validator(key).await
        {
            tracing::debug!(url, etag = %etag, "Conditional request");
            request = request.header(IF_NONE_MATCH, etag);
        }

        tracing::debug!(%method, url, attempt = attempt.attempt, "HTTP request");
        let response = request.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        tracing::debug!(status, "HTTP response");

        match status {
            304 => {
                if let Some((cache, key)) = &cached
                    && let Some(body) = cache.get_body(key).await
                {
                    tracing::debug!(url, "Cache hit");
                    return Ok(Response {
                        status: 200,
                        headers,
                        body,
                        from_cache: true,
                    });
                }
                Err(Error::Api {
                    status,
                    message: "304 received but no cached response available".to_string(),
                })
            }
            200 | 201 | 204 => {
                let mut body = read_limited(response, limits.max_response_bytes).await?;
                if status == 204 {
                    body = bytes::Bytes::from_static(b"null");
                }

                if let Some((cache, key)) = &cached
                    && let Some(etag) = headers.get(ETAG).and_then(|v| v.to_str().ok())
                {
                    match cache.set(key, &body, etag).await {
                        Ok(()) => tracing::debug!(url, etag, "Cache stored"),
                        Err(e) => tracing::warn!(url, error = %e, "Cache write failed"),
                    }
                }

                Ok(Response {
                    status,
                    headers,
                    body,
                    from_cache: false,
                })
            }
            _ => {
                let body = read_limited(response, limits.max_error_bytes)
                    .await
                    .unwrap_or_default();
                Err(classify_status(
                    status,
                    &headers,
                    &body,
                    attempt.kind,
                    url,
                    limits.max_error_message_bytes,
                ))
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.config.base_url)
            .field("account_id", &self.config.account_id)
            .field("token_provider", &self.token_provider.name())
            .field("cache", &self.cache.as_ref().map(|c| c.dir().to_path_buf()))
            .finish()
    }
}

/// Extract the `rel="next"` target of a `Link` header.
fn parse_next_link(header: &str) -> Option<&str> {
    header
        .split(',')
        .map(str::trim)
        .filter(|part| part.contains(r#"rel="next""#))
        .find_map(|part| {
            let start = part.find('<')?;
            let end = part.find('>')?;
            (end > start).then(|| &part[start + 1..end])
        })
}

#[derive(Default)]
pub struct ClientBuilder {
    config: ClientConfig,
    token_provider: Option<Arc<dyn TokenProvider>>,
    credential_store: Option<Arc<dyn CredentialStore>>,
    hooks: Option<Arc<dyn RequestHooks>>,
    cache: Option<ConditionalCache>,
    http: Option<reqwest::Client>,
    max_pages: Option<usize>,
}

impl ClientBuilder {
    /// Start from an existing configuration, e.g. [`ClientConfig::from_env`].
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    pub fn account_id(mut self, account_id: impl Into<String>) -> Self {
        self.config.account_id = Some(account_id.into());
        self
    }

    pub fn token_provider(self, provider: impl TokenProvider + 'static) -> Self {
        self.shared_token_provider(Arc::new(provider))
    }

    pub fn shared_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Authenticate through an [`AuthManager`] over `store`, built at [`build`](Self::build)
    /// time from the base URL and the configuration's auth settings.
    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credential_store = Some(store);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn RequestHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn cache(mut self, cache: ConditionalCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.config.cache_dir = Some(dir.into());
        self.config.cache_enabled = true;
        self
    }

    pub fn resilience(mut self, config: ResilienceConfig) -> Self {
        self.config.resilience = config;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn limits(mut self, limits: BodyLimits) -> Self {
        self.config.limits = limits;
        self
    }

    pub fn max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    /// Use a preconfigured `reqwest` client. Timeout and user agent settings are then
    /// the caller's responsibility.
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn build(self) -> Result<Client> {
        let config = self.config;
        config.validate()?;

        let cache = match self.cache {
            Some(cache) => Some(cache),
            None if config.cache_enabled => config.cache_dir.as_ref().map(|dir| {
                ConditionalCache::new(dir).with_max_body_bytes(config.limits.max_cache_body_bytes)
            }),
            None => None,
        };

        let http = match self.http {
            Some(http) => http,
            None => reqwest::Client::builder()
                .timeout(config.timeout)
                .user_agent(config.user_agent.clone())
                .build()
                .map_err(Error::Network)?,
        };

        let token_provider: Arc<dyn TokenProvider> =
            match (self.token_provider, self.credential_store) {
                (Some(provider), _) => provider,
                (None, Some(store)) => Arc::new(
                    AuthManager::new(&config.base_url, store)?
                        .with_config(config.auth.clone())
                        .with_http_client(http.clone()),
                ),
                (None, None) => Arc::new(StaticTokenProvider::from_env().ok_or_else(|| {
                    Error::Config(
                        "a token provider or credential store is required (or set RAMPART_TOKEN)"
                            .into(),
                    )
                })?),
            };

        let mut executor = Executor::new(config.resilience.clone())
            .with_token_provider(Arc::clone(&token_provider));
        if let Some(hooks) = self.hooks {
            executor = executor.with_hooks(hooks);
        }

        tracing::debug!(
            base_url = %config.base_url,
            provider = token_provider.name(),
            cache = cache.is_some(),
            "Client built"
        );

        Ok(Client {
            http,
            config: Arc::new(config),
            token_provider,
            cache: cache.map(Arc::new),
            executor: Arc::new(executor),
            max_pages: self.max_pages.unwrap_or(DEFAULT_MAX_PAGES).max(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(account: Option<&str>) -> Client {
        let mut builder = Client::builder()
            .base_url("https://api.example.com/")
            .token_provider(StaticTokenProvider::new("t"));
        if let Some(account) = account {
            builder = builder.account_id(account);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_build_url_with_account() {
        let client = client(Some("42"));
        assert_eq!(
            client.build_url("projects.json").unwrap(),
            "https://api.example.com/42/projects.json"
        );
        assert_eq!(
            client.build_url("/projects/1.json").unwrap(),
            "https://api.example.com/42/projects/1.json"
        );
    }

    #[test]
    fn test_build_url_without_account() {
        let client = client(None);
        assert_eq!(
            client.build_url("authorization.json").unwrap(),
            "https://api.example.com/authorization.json"
        );
    }

    #[test]
    fn test_absolute_urls() {
        let client = client(Some("42"));
        let next = "https://api.example.com/42/projects.json?page=2";
        assert_eq!(client.build_url(next).unwrap(), next);
        assert!(client.build_url("http://api.example.com/x").is_err());
        assert!(client.build_url("http://localhost:8080/x").is_ok());
    }

    #[test]
    fn test_builder_rejects_insecure_base_url() {
        let err = Client::builder()
            .base_url("http://api.example.com")
            .token_provider(StaticTokenProvider::new("t"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_builder_rejects_zero_attempts() {
        let err = Client::builder()
            .base_url("https://api.example.com")
            .token_provider(StaticTokenProvider::new("t"))
            .resilience(ResilienceConfig::default().retry(RetryConfig::default().max_attempts(0)))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_builder_cache_dir_enables_cache() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::builder()
            .base_url("https://api.example.com")
            .token_provider(StaticTokenProvider::new("t"))
            .cache_dir(dir.path())
            .build()
            .unwrap();
        assert_eq!(client.cache().unwrap().dir(), dir.path());
        assert!(format!("{:?}", client).contains("static"));
    }

    #[test]
    fn test_parse_next_link() {
        let header = r#"<https://x/a?page=1>; rel="prev", <https://x/a?page=3>; rel="next""#;
        assert_eq!(parse_next_link(header), Some("https://x/a?page=3"));
        assert_eq!(parse_next_link(r#"<https://x/a>; rel="prev""#), None);
        assert_eq!(parse_next_link(""), None);
    }
}
