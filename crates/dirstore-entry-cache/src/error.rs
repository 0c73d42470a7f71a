//! Error types for cache operations.

use thiserror::Error;

use crate::types::{Entry, EntryId, NormalizedDn};

/// Convenience alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Failures surfaced by the entry cache.
///
/// Per-entry lock contention is never an error: lookups retry internally
/// until the holder releases. `Corrupted` means a structural invariant broke
/// mid-operation; the cache must be treated as unusable once it is seen.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// A key is already held by a resident record.
    #[error("entry {id} (\"{ndn}\") is already cached")]
    Duplicate { id: EntryId, ndn: NormalizedDn },

    /// No resident record matches the requested key.
    #[error("no cached entry matches the requested key")]
    NotFound,

    /// A structural invariant failed mid-operation.
    #[error("entry cache corrupted: {reason}")]
    Corrupted { reason: &'static str },

    /// Rejected configuration.
    #[error("invalid cache configuration: {message}")]
    Config { message: String },
}

/// Rejected insertion from [`EntryCache::add`](crate::EntryCache::add).
///
/// Hands the payload back to the caller alongside the cause, so ownership of
/// the `Entry` is never lost on failure.
#[derive(Debug, Error)]
#[error("add rejected: {kind}")]
pub struct AddError {
    /// Why the insertion was rejected.
    pub kind: CacheError,
    /// The payload, returned to the caller untouched.
    pub entry: Entry,
}
