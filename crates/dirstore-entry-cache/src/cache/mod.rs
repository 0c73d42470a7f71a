//! In-memory entry cache with dual-index lookup and LRU eviction.
//!
//! Entries are resident under two keys at once: the normalized DN and the
//! numeric id, each in its own ordered index over the same record set. An
//! intrusive doubly-linked LRU list tracks recency; insertions that push the
//! cache over its bound trigger a bounded eviction scan that skips pinned
//! records. A per-record state machine (`Creating -> Committed -> Ready ->
//! Deleted`) coordinates lookups racing with creations and deletions, and a
//! refcount keeps deleted records alive until their last borrower returns.
//!
//! # Types
//!
//! - [`EntryCache`]: the cache; cheap to clone, safe to share across threads
//! - [`EntryGuard`]: an outstanding borrow, returned on drop
//! - [`AccessMode`]: shared-read or exclusive-write borrow
//! - [`CacheMetrics`]: atomic hit/miss/eviction/retry counters

mod core;
mod guard;
mod lru;
mod metrics;
mod record;

#[cfg(test)]
mod tests;

pub use self::core::EntryCache;
pub use guard::{AccessMode, EntryGuard};
pub use metrics::CacheMetrics;
