//! In-memory entry cache for the dirstore directory backend.
//!
//! The cache sits between the backend's persistent store and concurrent
//! query/modify operations. Entries are resident under two keys at once (the
//! normalized DN and the numeric id), recency is tracked by an intrusive LRU
//! list, and a per-entry state machine coordinates lookups racing with
//! creations and deletions.
//!
//! # Types
//!
//! - [`EntryCache`]: the cache itself; cheap to clone, safe to share
//! - [`EntryGuard`]: an outstanding borrow of a cached entry
//! - [`Entry`] / [`EntryId`] / [`NormalizedDn`]: the cached payload and keys
//! - [`CacheConfig`]: construction-time configuration
//! - [`CacheMetrics`]: atomic hit/miss/eviction counters
//!
//! # Example
//!
//! ```rust,ignore
//! use dirstore_entry_cache::{AccessMode, CacheConfig, EntryCache};
//!
//! let cache = EntryCache::new(CacheConfig { max_entries: 1000 })?;
//!
//! // Producer: insert, publish, release.
//! let guard = cache.add(entry, AccessMode::Write)?;
//! guard.commit();
//! drop(guard);
//!
//! // Reader: resolve a DN to an id, then pin the entry.
//! if let Some(id) = cache.find_by_dn(&ndn) {
//!     if let Some(entry) = cache.find_by_id(id, AccessMode::Read) {
//!         println!("dn = {}", entry.dn());
//!     }
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod types;

pub use cache::{AccessMode, CacheMetrics, EntryCache, EntryGuard};
pub use config::CacheConfig;
pub use error::{AddError, CacheError, CacheResult};
pub use types::{Attribute, Entry, EntryId, NormalizedDn};
