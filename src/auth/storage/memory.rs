//! Process-local credential storage.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::CredentialStore;
use crate::Result;
use crate::auth::Credential;

/// Keeps credentials in memory only; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: RwLock<HashMap<String, Credential>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(origin: impl Into<String>, credential: Credential) -> Self {
        Self {
            records: RwLock::new(HashMap::from([(origin.into(), credential)])),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load(&self, origin: &str) -> Result<Option<Credential>> {
        Ok(self.records.read().await.get(origin).cloned())
    }

    async fn save(&self, origin: &str, credential: &Credential) -> Result<()> {
        self.records
            .write()
            .await
            .insert(origin.to_string(), credential.clone());
        Ok(())
    }

    async fn delete(&self, origin: &str) -> Result<()> {
        self.records.write().await.remove(origin);
        Ok(())
    }
}
