//! Token provider trait.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::client::CallContext;
use crate::{Error, Result};

pub const TOKEN_ENV: &str = "RAMPART_TOKEN";

/// Source of bearer tokens for outgoing requests.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Provider name for debugging.
    fn name(&self) -> &str;

    /// A token valid for immediate use.
    async fn access_token(&self, ctx: &CallContext) -> Result<String>;

    /// Whether this provider supports token refresh.
    fn supports_refresh(&self) -> bool {
        false
    }

    /// Force a refresh, e.g. after the server rejected the current token.
    async fn refresh(&self, _ctx: &CallContext) -> Result<()> {
        Err(Error::auth("Refresh not supported"))
    }

    /// Refresh after the server rejected `rejected`. Providers that can tell the token
    /// was already replaced should return without refreshing again.
    async fn refresh_rejected(&self, ctx: &CallContext, _rejected: &str) -> Result<()> {
        self.refresh(ctx).await
    }
}

/// A fixed token, such as a personal access token.
pub struct StaticTokenProvider {
    token: SecretString,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
        }
    }

    /// Read the token from `RAMPART_TOKEN`.
    pub fn from_env() -> Option<Self> {
        std::env::var(TOKEN_ENV)
            .ok()
            .filter(|t| !t.is_empty())
            .map(Self::new)
    }
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("token", &"[redacted]")
            .finish()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    fn name(&self) -> &str {
        "static"
    }

    async fn access_token(&self, _ctx: &CallContext) -> Result<String> {
        Ok(self.token.expose_secret().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticTokenProvider::new("pat-123");
        let ctx = CallContext::new();
        assert_eq!(provider.access_token(&ctx).await.unwrap(), "pat-123");
        assert!(!provider.supports_refresh());
        assert!(provider.refresh(&ctx).await.unwrap_err().is_unauthorized());
        assert!(!format!("{:?}", provider).contains("pat-123"));
    }
}
