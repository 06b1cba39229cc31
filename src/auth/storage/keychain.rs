//! macOS Keychain credential storage.

use async_trait::async_trait;
use tokio::process::Command;

use super::CredentialStore;
use crate::auth::Credential;
use crate::{Error, Result};

const SERVICE_NAME: &str = "rampart-credentials";

// `security` exit status for a missing item.
const ITEM_NOT_FOUND: i32 = 44;

/// Generic-password items under one service, with the origin as the account name.
///
/// Items are written with the `security` tool, which only accepts the secret as a
/// command-line argument. While `save` runs, the serialized credential (refresh token
/// included) is therefore visible to other local users through the process list. Set
/// `RAMPART_NO_KEYCHAIN` to have [`default_store`](crate::auth::default_store) pick the
/// file store instead on shared machines.
#[derive(Debug, Default)]
pub struct KeychainStorage;

impl KeychainStorage {
    pub fn new() -> Self {
        Self
    }

    async fn security(args: &[&str]) -> Result<std::process::Output> {
        Command::new("security")
            .args(args)
            .output()
            .await
            .map_err(|e| Error::auth(format!("Failed to execute security command: {}", e)))
    }
}

#[async_trait]
impl CredentialStore for KeychainStorage {
    fn name(&self) -> &str {
        "keychain"
    }

    async fn load(&self, origin: &str) -> Result<Option<Credential>> {
        let output =
            Self::security(&["find-generic-password", "-s", SERVICE_NAME, "-a", origin, "-w"])
                .await?;

        if !output.status.success() {
            tracing::debug!(origin, "Keychain entry not found");
            return Ok(None);
        }

        let secret = String::from_utf8_lossy(&output.stdout);
        let secret = secret.trim();
        if secret.is_empty() {
            return Ok(None);
        }

        let credential = serde_json::from_str(secret)
            .map_err(|e| Error::auth(format!("Failed to parse keychain credentials: {}", e)))?;
        Ok(Some(credential))
    }

    async fn save(&self, origin: &str, credential: &Credential) -> Result<()> {
        let data = serde_json::to_string(credential)?;
        let output = Self::security(&[
            "add-generic-password",
            "-U",
            "-s",
            SERVICE_NAME,
            "-a",
            origin,
            "-w",
            &data,
        ])
        .await?;

        if !output.status.success() {
            return Err(Error::auth(format!(
                "Failed to store keychain credentials: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn delete(&self, origin: &str) -> Result<()> {
        let output =
            Self::security(&["delete-generic-password", "-s", SERVICE_NAME, "-a", origin]).await?;

        match output.status.code() {
            Some(0) | Some(ITEM_NOT_FOUND) => Ok(()),
            _ => Err(Error::auth(format!(
                "Failed to delete keychain credentials: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }
}
