//! Credential storage implementations.

mod file;
#[cfg(target_os = "macos")]
mod keychain;
mod memory;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::Credential;
use crate::Result;

pub use file::FileStorage;
#[cfg(target_os = "macos")]
pub use keychain::KeychainStorage;
pub use memory::MemoryStorage;

pub const NO_KEYCHAIN_ENV: &str = "RAMPART_NO_KEYCHAIN";

/// Persistent credential records keyed by origin.
///
/// Implementations keep each origin's record independent: saving or deleting one origin
/// never disturbs another.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self, origin: &str) -> Result<Option<Credential>>;

    async fn save(&self, origin: &str, credential: &Credential) -> Result<()>;

    /// Deleting an origin with no record succeeds.
    async fn delete(&self, origin: &str) -> Result<()>;
}

/// `<platform config dir>/rampart`.
pub fn default_credentials_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("rampart"))
}

/// The platform store: the macOS keychain unless `RAMPART_NO_KEYCHAIN` is set, otherwise
/// files under `fallback_dir`.
pub fn default_store(fallback_dir: impl Into<PathBuf>) -> Arc<dyn CredentialStore> {
    let fallback_dir = fallback_dir.into();

    #[cfg(target_os = "macos")]
    {
        if std::env::var_os(NO_KEYCHAIN_ENV).is_none() {
            tracing::debug!("Using macOS keychain credential store");
            return Arc::new(KeychainStorage::new());
        }
    }

    tracing::debug!(dir = %fallback_dir.display(), "Using file credential store");
    Arc::new(FileStorage::new(fallback_dir))
}
