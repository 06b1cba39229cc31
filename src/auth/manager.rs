//! Credential lifecycle for one origin: lookup, refresh, login and logout.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use tokio::sync::Mutex;

use super::origin::{origin_of, require_secure_endpoint};
use super::{Credential, CredentialStore, TokenProvider};
use crate::client::CallContext;
use crate::client::classify::truncate;
use crate::client::response::read_limited;
use crate::config::AuthConfig;
use crate::{Error, Result};

const MAX_REFRESH_ERROR_CHARS: usize = 500;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Keeps the stored credential for one origin valid.
///
/// Lookups of a fresh credential take no lock. Anything that writes the stored
/// credential (refresh, login, logout, user id changes) is serialized behind one mutex,
/// so concurrent callers that all find the credential near expiry trigger a single
/// refresh between them.
pub struct AuthManager {
    origin: String,
    store: Arc<dyn CredentialStore>,
    http: reqwest::Client,
    config: AuthConfig,
    write_lock: Mutex<()>,
}

impl AuthManager {
    pub fn new(base_url: &str, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            origin: origin_of(base_url)?,
            store,
            http,
            config: AuthConfig::default(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn with_config(mut self, config: AuthConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub async fn credential(&self) -> Result<Option<Credential>> {
        self.store.load(&self.origin).await
    }

    /// A token valid for at least the refresh buffer, refreshing first if needed.
    pub async fn access_token(&self, ctx: &CallContext) -> Result<String> {
        let credential = self.load_required().await?;
        if !credential.needs_refresh(self.config.refresh_buffer) {
            return Ok(credential.access_token);
        }

        let _guard = ctx.run(self.write_lock.lock()).await?;
        // Another caller may have refreshed while we waited.
        let credential = self.load_required().await?;
        if !credential.needs_refresh(self.config.refresh_buffer) {
            return Ok(credential.access_token);
        }
        let refreshed = self.refresh_locked(ctx, credential).await?;
        Ok(refreshed.access_token)
    }

    /// Refresh the currently stored token now.
    ///
    /// A refresh that completed while this call waited for the lock counts as done.
    pub async fn refresh(&self, ctx: &CallContext) -> Result<()> {
        let observed = self.load_required().await?.access_token;
        self.refresh_rejected(ctx, &observed).await
    }

    /// Refresh after the server rejected `rejected`.
    ///
    /// Does nothing when the stored token no longer matches, since some other caller
    /// has already replaced it. Any number of 401s for the same token cause one refresh.
    pub async fn refresh_rejected(&self, ctx: &CallContext, rejected: &str) -> Result<()> {
        let _guard = ctx.run(self.write_lock.lock()).await?;
        let credential = self.load_required().await?;
        if credential.access_token != rejected {
            tracing::debug!(origin = %self.origin, "Credential already refreshed");
            return Ok(());
        }
        self.refresh_locked(ctx, credential).await.map(|_| ())
    }

    /// Store a freshly authorized credential.
    pub async fn login(&self, credential: Credential) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store.save(&self.origin, &credential).await?;
        tracing::info!(origin = %self.origin, "Credential stored");
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store.delete(&self.origin).await?;
        tracing::info!(origin = %self.origin, "Credential removed");
        Ok(())
    }

    pub async fn is_authenticated(&self) -> bool {
        matches!(self.credential().await, Ok(Some(c)) if !c.access_token.is_empty())
    }

    pub async fn user_id(&self) -> Result<Option<String>> {
        Ok(self.credential().await?.and_then(|c| c.user_id))
    }

    pub async fn set_user_id(&self, user_id: impl Into<String>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut credential = self.load_required().await?;
        credential.user_id = Some(user_id.into());
        self.store.save(&self.origin, &credential).await
    }

    async fn load_required(&self) -> Result<Credential> {
        self.store
            .load(&self.origin)
            .await?
            .ok_or_else(|| Error::auth("Not authenticated"))
    }

    /// Exchange the refresh token and persist the result. Caller holds `write_lock`.
    async fn refresh_locked(
        &self,
        ctx: &CallContext,
        mut credential: Credential,
    ) -> Result<Credential> {
        let refresh_token = credential
            .refresh_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::auth("No refresh token available"))?;
        let endpoint = credential
            .token_endpoint
            .clone()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| Error::auth("No token endpoint stored"))?;
        let endpoint = require_secure_endpoint(&endpoint)?;

        let form = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "refresh_token")
            .append_pair("refresh_token", &refresh_token)
            .finish();

        tracing::debug!(origin = %self.origin, "Refreshing credential");
        let request = self
            .http
            .post(endpoint)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(ACCEPT, "application/json")
            .body(form)
            .send();
        let response = ctx.run(request).await??;

        let status = response.status().as_u16();
        let limit = self.config.max_refresh_body_bytes;
        if status != 200 {
            let body = ctx
                .run(read_limited(response, limit))
                .await?
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default();
            tracing::warn!(origin = %self.origin, status, "Credential refresh rejected");
            return Err(Error::Api {
                status,
                message: truncate(
                    &format!("token refresh failed: {}", body),
                    MAX_REFRESH_ERROR_CHARS,
                ),
            });
        }

        let body = ctx.run(read_limited(response, limit)).await??;
        let token: TokenResponse = serde_json::from_slice(&body)?;
        if token.access_token.is_empty() {
            return Err(Error::auth("Token endpoint returned no access token"));
        }

        credential.access_token = token.access_token;
        if let Some(refresh) = token.refresh_token.filter(|t| !t.is_empty()) {
            credential.refresh_token = Some(refresh);
        }
        if let Some(expires_in) = token.expires_in.filter(|s| *s > 0) {
            credential.expires_at = chrono::Utc::now().timestamp() + expires_in;
        }

        self.store.save(&self.origin, &credential).await?;
        tracing::info!(
            origin = %self.origin,
            expires_at = credential.expires_at,
            "Credential refreshed"
        );
        Ok(credential)
    }
}

impl std::fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthManager")
            .field("origin", &self.origin)
            .field("store", &self.store.name())
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl TokenProvider for AuthManager {
    fn name(&self) -> &str {
        "auth_manager"
    }

    async fn access_token(&self, ctx: &CallContext) -> Result<String> {
        AuthManager::access_token(self, ctx).await
    }

    fn supports_refresh(&self) -> bool {
        true
    }

    async fn refresh(&self, ctx: &CallContext) -> Result<()> {
        AuthManager::refresh(self, ctx).await
    }

    async fn refresh_rejected(&self, ctx: &CallContext, rejected: &str) -> Result<()> {
        AuthManager::refresh_rejected(self, ctx, rejected).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::auth::MemoryStorage;

    const ORIGIN: &str = "https://api.example.com";

    fn manager(credential: Option<Credential>) -> AuthManager {
        let store = match credential {
            Some(c) => MemoryStorage::with_credential(ORIGIN, c),
            None => MemoryStorage::new(),
        };
        AuthManager::new("https://api.example.com/42/", Arc::new(store)).unwrap()
    }

    #[tokio::test]
    async fn test_fresh_token_returned_without_refresh() {
        let cred = Credential::expiring_in("fresh", Duration::from_secs(3600));
        let auth = manager(Some(cred));
        assert_eq!(auth.origin(), ORIGIN);
        assert_eq!(auth.access_token(&CallContext::new()).await.unwrap(), "fresh");
        assert!(auth.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_missing_credential_is_unauthorized() {
        let auth = manager(None);
        let err = auth.access_token(&CallContext::new()).await.unwrap_err();
        assert!(err.is_unauthorized());
        assert!(!auth.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_refresh_requires_refresh_token_and_endpoint() {
        let auth = manager(Some(Credential::new("stale", 0)));
        let err = auth.access_token(&CallContext::new()).await.unwrap_err();
        assert!(err.to_string().contains("No refresh token"));

        let auth = manager(Some(Credential::new("stale", 0).with_refresh_token("r")));
        let err = auth.access_token(&CallContext::new()).await.unwrap_err();
        assert!(err.to_string().contains("No token endpoint"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_refresh_endpoint_must_be_https() {
        let cred = Credential::new("stale", 0)
            .with_refresh_token("r")
            .with_token_endpoint("http://auth.example.com/token");
        let auth = manager(Some(cred));
        let err = auth.access_token(&CallContext::new()).await.unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[tokio::test]
    async fn test_user_id_and_logout() {
        let auth = manager(Some(Credential::expiring_in("t", Duration::from_secs(3600))));
        assert_eq!(auth.user_id().await.unwrap(), None);

        auth.set_user_id("1049715914").await.unwrap();
        assert_eq!(auth.user_id().await.unwrap().as_deref(), Some("1049715914"));

        auth.logout().await.unwrap();
        assert!(!auth.is_authenticated().await);
        assert!(auth.set_user_id("x").await.is_err());
    }

    #[tokio::test]
    async fn test_login_stores_credential() {
        let auth = manager(None);
        auth.login(Credential::expiring_in("new", Duration::from_secs(60 * 60)))
            .await
            .unwrap();
        assert_eq!(auth.access_token(&CallContext::new()).await.unwrap(), "new");
    }
}
