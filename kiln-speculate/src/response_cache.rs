//! Request/response cache keyed by request fingerprint.
//!
//! Filled by the prefetcher ahead of demand and consulted by transform
//! functions through [`ResponseCache::get_or_fetch`], which falls back to a
//! synchronous provider call on a miss.

use dashmap::DashMap;
use kiln_core::{ExternalRequest, KilnResult, RequestFingerprint};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::provider::ExternalProvider;

#[derive(Debug, Clone)]
struct CachedResponse {
    value: serde_json::Value,
    /// Batch in which the entry was last inserted or read.
    last_batch: u64,
    prefetched: bool,
}

/// Statistics about response cache usage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    /// Entries inserted by the prefetcher.
    pub prefetched: u64,
}

impl ResponseCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Concurrent request/response cache.
pub struct ResponseCache {
    entries: DashMap<RequestFingerprint, CachedResponse>,
    capacity: usize,
    batch: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            batch: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn current_batch(&self) -> u64 {
        self.batch.load(Ordering::Relaxed)
    }

    /// Look up a response, counting the hit or miss.
    pub fn get(&self, fingerprint: &RequestFingerprint) -> Option<serde_json::Value> {
        let batch = self.current_batch();
        match self.entries.get_mut(fingerprint) {
            Some(mut entry) => {
                entry.last_batch = batch;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn contains(&self, fingerprint: &RequestFingerprint) -> bool {
        self.entries.contains_key(fingerprint)
    }

    /// Insert a response. A full cache only accepts replacements.
    pub fn insert(&self, fingerprint: RequestFingerprint, value: serde_json::Value, prefetched: bool) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&fingerprint) {
            tracing::trace!(capacity = self.capacity, "Response cache full; dropping response");
            return;
        }
        self.entries.insert(
            fingerprint,
            CachedResponse {
                value,
                last_batch: self.current_batch(),
                prefetched,
            },
        );
    }

    /// Serve `request` from cache, or call `provider` and cache the result.
    ///
    /// Provider errors are returned and not cached.
    pub async fn get_or_fetch(
        &self,
        request: &ExternalRequest,
        provider: &dyn ExternalProvider,
    ) -> KilnResult<serde_json::Value> {
        let fingerprint = request.fingerprint();
        if let Some(value) = self.get(&fingerprint) {
            return Ok(value);
        }
        let value = provider.call(request).await?;
        self.insert(fingerprint, value.clone(), false);
        Ok(value)
    }

    /// Start a new batch and return its number.
    pub fn advance_batch(&self) -> u64 {
        self.batch.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Drop entries not touched during the last `max_age` batches.
    /// Returns the number of entries removed.
    pub fn sweep(&self, max_age: u64) -> usize {
        let horizon = self.current_batch().saturating_sub(max_age);
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.last_batch >= horizon);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, remaining = self.entries.len(), "Swept stale responses");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> ResponseCacheStats {
        ResponseCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len() as u64,
            prefetched: self.entries.iter().filter(|e| e.prefetched).count() as u64,
        }
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("capacity", &self.capacity)
            .field("current_size", &self.len())
            .finish()
    }
}
