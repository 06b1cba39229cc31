//! On-disk conditional response cache.
//!
//! Layout under the cache directory:
//!
//! ```text
//! validators.json         key -> validator (ETag) index
//! responses/{key}.body    cached body per key
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::persist::{remove_if_exists, write_atomic};
use crate::{Error, Result};

const INDEX_FILE: &str = "validators.json";
const BODY_DIR: &str = "responses";
const KEY_LEN: usize = 64;

pub const DEFAULT_MAX_CACHE_BODY_BYTES: u64 = 50 * 1024 * 1024;

/// Stores validators and bodies of earlier successful reads.
///
/// One lock guards the index: lookups share it, writers hold it exclusively. Every file
/// is replaced atomically, so a lookup never sees a half-written entry.
#[derive(Debug)]
pub struct ConditionalCache {
    dir: PathBuf,
    max_body_bytes: u64,
    lock: RwLock<()>,
}

impl ConditionalCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_body_bytes: DEFAULT_MAX_CACHE_BODY_BYTES,
            lock: RwLock::new(()),
        }
    }

    pub fn with_max_body_bytes(mut self, max: u64) -> Self {
        self.max_body_bytes = max;
        self
    }

    /// `<platform cache dir>/rampart`.
    pub fn default_dir() -> Option<PathBuf> {
        directories::BaseDirs::new().map(|d| d.cache_dir().join("rampart"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Derive the entry key for a (url, tenant, credential) triple.
    ///
    /// Only a truncated digest of the credential enters the key. Each field is length
    /// prefixed so distinct triples never share a preimage.
    pub fn key(url: &str, tenant: &str, credential: &str) -> String {
        let credential_digest = if credential.is_empty() {
            String::new()
        } else {
            hex::encode(&Sha256::digest(credential.as_bytes())[..8])
        };

        let mut hasher = Sha256::new();
        for field in [url, tenant, credential_digest.as_str()] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub async fn get_validator(&self, key: &str) -> Option<String> {
        let _guard = self.lock.read().await;
        self.read_index().await.remove(key)
    }

    pub async fn get_body(&self, key: &str) -> Option<Bytes> {
        let path = self.body_path(key)?;
        let _guard = self.lock.read().await;
        tokio::fs::read(path).await.ok().map(Bytes::from)
    }

    /// Store `body` under `key` with its validator. Bodies over the size ceiling are
    /// refused and nothing is written.
    pub async fn set(&self, key: &str, body: &[u8], validator: &str) -> Result<()> {
        if body.len() as u64 > self.max_body_bytes {
            return Err(Error::SizeLimitExceeded {
                limit: self.max_body_bytes,
            });
        }
        let path = self
            .body_path(key)
            .ok_or_else(|| Error::usage(format!("invalid cache key: {}", key)))?;

        let _guard = self.lock.write().await;
        write_atomic(&path, body).await?;

        let mut index = self.read_index().await;
        index.insert(key.to_string(), validator.to_string());
        self.write_index(&index).await?;

        tracing::debug!(key, bytes = body.len(), "Cached response stored");
        Ok(())
    }

    pub async fn invalidate(&self, key: &str) -> Result<()> {
        let _guard = self.lock.write().await;
        if let Some(path) = self.body_path(key) {
            remove_if_exists(&path).await?;
        }
        let mut index = self.read_index().await;
        if index.remove(key).is_some() {
            self.write_index(&index).await?;
        }
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.write().await;
        match tokio::fs::remove_dir_all(self.dir.join(BODY_DIR)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        remove_if_exists(&self.dir.join(INDEX_FILE)).await?;
        Ok(())
    }

    fn body_path(&self, key: &str) -> Option<PathBuf> {
        let valid = key.len() == KEY_LEN && key.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then(|| self.dir.join(BODY_DIR).join(format!("{}.body", key)))
    }

    async fn read_index(&self) -> HashMap<String, String> {
        match tokio::fs::read(self.dir.join(INDEX_FILE)).await {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Ignoring unreadable cache index");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        }
    }

    async fn write_index(&self, index: &HashMap<String, String>) -> Result<()> {
        let data = serde_json::to_vec_pretty(index)?;
        write_atomic(&self.dir.join(INDEX_FILE), &data).await?;
        Ok(())
    }
}
