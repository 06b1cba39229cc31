//! File-based credential storage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use super::CredentialStore;
use crate::auth::Credential;
use crate::persist::{remove_if_exists, write_atomic};
use crate::{Error, Result};

const CREDENTIALS_DIR: &str = "credentials";

#[derive(Serialize, Deserialize)]
struct StoredCredential {
    origin: String,
    credential: Credential,
}

/// One JSON file per origin under `<dir>/credentials/`, each replaced atomically.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    lock: RwLock<()>,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, origin: &str) -> PathBuf {
        let digest = hex::encode(&Sha256::digest(origin.as_bytes())[..16]);
        self.dir
            .join(CREDENTIALS_DIR)
            .join(format!("{}.json", digest))
    }
}

#[async_trait]
impl CredentialStore for FileStorage {
    fn name(&self) -> &str {
        "file"
    }

    async fn load(&self, origin: &str) -> Result<Option<Credential>> {
        let path = self.record_path(origin);
        let _guard = self.lock.read().await;

        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::auth(format!(
                    "Failed to read credentials file: {}",
                    e
                )));
            }
        };

        let stored: StoredCredential = serde_json::from_slice(&content)
            .map_err(|e| Error::auth(format!("Failed to parse credentials: {}", e)))?;
        if stored.origin != origin {
            tracing::warn!(origin, "Credential record belongs to a different origin");
            return Ok(None);
        }
        Ok(Some(stored.credential))
    }

    async fn save(&self, origin: &str, credential: &Credential) -> Result<()> {
        let data = serde_json::to_vec_pretty(&StoredCredential {
            origin: origin.to_string(),
            credential: credential.clone(),
        })?;
        let _guard = self.lock.write().await;
        write_atomic(&self.record_path(origin), &data).await?;
        Ok(())
    }

    async fn delete(&self, origin: &str) -> Result<()> {
        let _guard = self.lock.write().await;
        remove_if_exists(&self.record_path(origin)).await?;
        Ok(())
    }
}
