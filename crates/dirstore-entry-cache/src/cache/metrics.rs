//! Thread-safe cache metrics with atomic counters.
//!
//! All counters use relaxed ordering; exact consistency is not required for
//! statistical monitoring.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Lookups that returned an entry (or resolved a DN to an id).
    pub hits: AtomicU64,
    /// Lookups whose key was absent.
    pub misses: AtomicU64,
    /// Records removed by the eviction scan.
    pub evictions: AtomicU64,
    /// Lookup retries: the record was not yet `Ready`, or its per-entry
    /// lock was contended.
    pub retries: AtomicU64,
}

impl CacheMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Hit rate: hits / (hits + misses). Zero when no lookups have run.
    #[must_use]
    pub fn hit_rate(&self) -> f32 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f32 / total as f32
        }
    }
}
