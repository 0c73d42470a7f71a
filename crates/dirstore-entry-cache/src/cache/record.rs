//! Per-record metadata: the lifecycle state machine and the arena record.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::{Entry, EntryId, NormalizedDn};

/// Arena handle for a resident (or delete-pending) record.
///
/// Ids are assigned monotonically and never reused, so a stale handle can
/// only miss; it can never alias a newer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RecordId(pub(crate) u64);

/// Lifecycle state of a cached record.
///
/// Only `Ready` records are visible to lookups. `Creating` and `Committed`
/// are producer-held pre-publication states; a `Deleted` record is already
/// unlinked from the indices and the LRU list and survives only until its
/// last borrow returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
    /// Inserted but not yet declared valid by the producer.
    Creating,
    /// Declared valid; becomes `Ready` when the producer's borrow returns.
    Committed,
    /// Published. Visible to lookups and eligible for further borrows.
    Ready,
    /// Unlinked. Freed when the refcount reaches zero.
    Deleted,
}

impl EntryState {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            EntryState::Creating => "creating",
            EntryState::Committed => "committed",
            EntryState::Ready => "ready",
            EntryState::Deleted => "deleted",
        }
    }
}

/// One cached entry plus its cache-side metadata.
///
/// Every field except `payload` is guarded by the cache mutex. The payload
/// is guarded by its own reader-writer lock for the duration of borrows.
/// `key_id` and `key_ndn` are snapshots of the payload's key fields taken at
/// insertion time, so index maintenance never has to read through the
/// payload lock.
#[derive(Debug)]
pub(crate) struct EntryRecord {
    pub(crate) state: EntryState,
    /// Number of outstanding borrows.
    pub(crate) refcnt: u32,
    pub(crate) lru_prev: Option<RecordId>,
    pub(crate) lru_next: Option<RecordId>,
    pub(crate) key_id: EntryId,
    pub(crate) key_ndn: NormalizedDn,
    pub(crate) payload: Arc<RwLock<Entry>>,
}

impl EntryRecord {
    /// New record in `Creating` state with the producer's borrow counted.
    pub(crate) fn new_creating(
        key_id: EntryId,
        key_ndn: NormalizedDn,
        payload: Arc<RwLock<Entry>>,
    ) -> Self {
        EntryRecord {
            state: EntryState::Creating,
            refcnt: 1,
            lru_prev: None,
            lru_next: None,
            key_id,
            key_ndn,
            payload,
        }
    }
}
