//! Provider instance cache.
//!
//! Constructing a provider can be expensive (HTTP client setup, runtime file
//! checks), so instances are memoized for the life of the process, keyed by
//! provider, model and credential fingerprint. Each key owns a
//! `tokio::sync::OnceCell`: concurrent first uses run the constructor once and
//! all receive the same `Arc`. A failed construction leaves the cell empty so
//! the next caller tries again.
//!
//! Lookups take a shared read lock on the key map for the duration of one
//! hash lookup. Readers only wait on a writer inserting a new key; the map
//! lock is never held while a provider is being constructed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::OnceCell;

use crate::error::ProviderError;
use crate::provider::VisionProvider;
use crate::types::ProviderKind;

/// Identity of a cached provider instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub provider: ProviderKind,
    pub model: String,
    /// Credential fingerprint, never the credential itself
    pub fingerprint: String,
}

impl CacheKey {
    pub fn new(provider: ProviderKind, model: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            fingerprint: fingerprint.into(),
        }
    }
}

/// Counters for cache diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub lookups: u64,
    pub constructions: u64,
    pub entries: usize,
}

type Slot = Arc<OnceCell<Arc<dyn VisionProvider>>>;

/// Process-lifetime memo of constructed providers. Never evicts.
#[derive(Default)]
pub struct ProviderInstanceCache {
    slots: RwLock<HashMap<CacheKey, Slot>>,
    lookups: AtomicU64,
    constructions: AtomicU64,
}

impl ProviderInstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the instance for `key`, constructing it with `init` on first use.
    pub async fn get_or_try_init<F, Fut>(
        &self,
        key: &CacheKey,
        init: F,
    ) -> Result<Arc<dyn VisionProvider>, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn VisionProvider>, ProviderError>>,
    {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let slot = self.slot(key);
        if let Some(provider) = slot.get() {
            return Ok(provider.clone());
        }

        let provider = slot
            .get_or_try_init(|| async {
                self.constructions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    provider = %key.provider,
                    model = %key.model,
                    "Constructing provider instance"
                );
                init().await
            })
            .await?;
        Ok(provider.clone())
    }

    /// Existing instance for `key`, without constructing. Takes the map's
    /// read lock.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<dyn VisionProvider>> {
        let slots = self.slots.read().ok()?;
        slots.get(key).and_then(|slot| slot.get().cloned())
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self
            .slots
            .read()
            .map(|slots| slots.values().filter(|slot| slot.initialized()).count())
            .unwrap_or(0);
        CacheStats {
            lookups: self.lookups.load(Ordering::Relaxed),
            constructions: self.constructions.load(Ordering::Relaxed),
            entries,
        }
    }

    /// Shared cell for `key`. The read lock covers the common case; the
    /// write lock is taken only to insert a missing key.
    fn slot(&self, key: &CacheKey) -> Slot {
        if let Ok(slots) = self.slots.read() {
            if let Some(slot) = slots.get(key) {
                return slot.clone();
            }
        }
        match self.slots.write() {
            Ok(mut slots) => slots.entry(key.clone()).or_default().clone(),
            // Poisoned map: hand out a private slot so the caller still works
            Err(_) => Arc::new(OnceCell::new()),
        }
    }
}
