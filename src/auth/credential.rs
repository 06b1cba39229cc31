//! Credential types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A bearer credential for one origin.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Expiration timestamp (Unix seconds).
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// OAuth token endpoint used for refresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, expires_at: i64) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at,
            scope: None,
            user_id: None,
            token_endpoint: None,
        }
    }

    /// Credential expiring `lifetime` from now.
    pub fn expiring_in(access_token: impl Into<String>, lifetime: Duration) -> Self {
        Self::new(access_token, Utc::now().timestamp() + lifetime.as_secs() as i64)
    }

    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    pub fn with_token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn expires_at_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.expires_at, 0)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() >= self.expires_at
    }

    /// True once the credential is within `buffer` of its expiry.
    pub fn needs_refresh(&self, buffer: Duration) -> bool {
        Utc::now().timestamp() >= self.expires_at.saturating_sub(buffer.as_secs() as i64)
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
            && self.token_endpoint.as_deref().is_some_and(|e| !e.is_empty())
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[redacted]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[redacted]"),
            )
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("user_id", &self.user_id)
            .field("token_endpoint", &self.token_endpoint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry() {
        let expired = Credential::new("test", 0);
        assert!(expired.is_expired());
        assert!(expired.needs_refresh(Duration::ZERO));

        let fresh = Credential::expiring_in("test", Duration::from_secs(3600));
        assert!(!fresh.is_expired());
        assert!(!fresh.needs_refresh(Duration::from_secs(300)));
    }

    #[test]
    fn test_needs_refresh_within_buffer() {
        let soon = Credential::expiring_in("test", Duration::from_secs(120));
        assert!(!soon.is_expired());
        assert!(soon.needs_refresh(Duration::from_secs(300)));
        assert!(!soon.needs_refresh(Duration::from_secs(60)));
    }

    #[test]
    fn test_can_refresh() {
        let bare = Credential::new("a", 0);
        assert!(!bare.can_refresh());
        assert!(!bare.clone().with_refresh_token("r").can_refresh());
        assert!(
            bare.with_refresh_token("r")
                .with_token_endpoint("https://auth.example.com/token")
                .can_refresh()
        );
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let cred = Credential::new("secret-access", 0).with_refresh_token("secret-refresh");
        let debug = format!("{:?}", cred);
        assert!(!debug.contains("secret-access"));
        assert!(!debug.contains("secret-refresh"));
        assert!(debug.contains("[redacted]"));
    }

    #[test]
    fn test_optional_fields_round_trip_as_absent() {
        let cred = Credential::new("a", 42);
        let json = serde_json::to_string(&cred).unwrap();
        assert_eq!(json, r#"{"access_token":"a","expires_at":42}"#);
        assert_eq!(serde_json::from_str::<Credential>(&json).unwrap(), cred);
    }
}
