//! Per-scope concurrency admission.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::client::CallContext;
use crate::{Error, Result};

#[derive(Clone, Debug)]
pub struct BulkheadConfig {
    pub max_concurrent: usize,
    /// How long `acquire` waits for a slot. Zero means admit-or-reject.
    pub max_wait: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_wait: Duration::from_secs(5),
        }
    }
}

impl BulkheadConfig {
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = wait;
        self
    }
}

/// A held bulkhead slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

pub struct Bulkhead {
    scope: String,
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
}

impl Bulkhead {
    pub fn new(scope: impl Into<String>, config: BulkheadConfig) -> Self {
        let capacity = config.max_concurrent.max(1);
        Self {
            scope: scope.into(),
            config: BulkheadConfig {
                max_concurrent: capacity,
                ..config
            },
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Wait for a slot, bounded by `max_wait` and by the caller's context.
    ///
    /// A fired context yields the context's own error; running out of `max_wait` yields
    /// [`Error::BulkheadFull`].
    pub async fn acquire(&self, ctx: &CallContext) -> Result<BulkheadPermit> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        if self.config.max_wait.is_zero() {
            return self.try_acquire().ok_or_else(|| self.full());
        }

        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        tokio::select! {
            biased;
            err = ctx.done() => Err(err),
            permit = acquire => permit
                .map(|p| BulkheadPermit { _permit: p })
                .map_err(|_| self.full()),
            _ = tokio::time::sleep(self.config.max_wait) => {
                tracing::debug!(scope = %self.scope, wait = ?self.config.max_wait, "Bulkhead wait timed out");
                Err(self.full())
            }
        }
    }

    pub fn try_acquire(&self) -> Option<BulkheadPermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|p| BulkheadPermit { _permit: p })
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.config.max_concurrent - self.available()
    }

    pub fn capacity(&self) -> usize {
        self.config.max_concurrent
    }

    fn full(&self) -> Error {
        Error::BulkheadFull {
            scope: self.scope.clone(),
        }
    }
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("scope", &self.scope)
            .field("capacity", &self.config.max_concurrent)
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// Lazily created bulkheads keyed by scope.
///
/// Lookups take a shard read lock; a missing scope is created under the shard write lock,
/// so concurrent first use never creates two bulkheads for one scope.
#[derive(Debug)]
pub struct BulkheadRegistry {
    config: BulkheadConfig,
    bulkheads: DashMap<String, Arc<Bulkhead>>,
}

impl BulkheadRegistry {
    pub fn new(config: BulkheadConfig) -> Self {
        Self {
            config,
            bulkheads: DashMap::new(),
        }
    }

    pub fn get(&self, scope: &str) -> Arc<Bulkhead> {
        if let Some(bh) = self.bulkheads.get(scope) {
            return Arc::clone(bh.value());
        }

        let entry = self
            .bulkheads
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(Bulkhead::new(scope, self.config.clone())));
        Arc::clone(entry.value())
    }

    pub fn len(&self) -> usize {
        self.bulkheads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bulkheads.is_empty()
    }
}

impl Default for BulkheadRegistry {
    fn default() -> Self {
        Self::new(BulkheadConfig::default())
    }
}
