//! Credentials for outgoing requests.
//!
//! - [`TokenProvider`]: where bearer tokens come from
//! - [`AuthManager`]: per-origin credential with single-flight refresh
//! - [`CredentialStore`]: file, keychain (macOS) or in-memory persistence

mod credential;
mod manager;
mod origin;
mod provider;
mod storage;

pub use credential::Credential;
pub use manager::AuthManager;
pub use origin::{is_loopback, origin_of, require_secure_endpoint};
pub use provider::{StaticTokenProvider, TOKEN_ENV, TokenProvider};
#[cfg(target_os = "macos")]
pub use storage::KeychainStorage;
pub use storage::{
    CredentialStore, FileStorage, MemoryStorage, NO_KEYCHAIN_ENV, default_credentials_dir,
    default_store,
};
