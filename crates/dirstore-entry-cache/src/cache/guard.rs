//! Borrow guards for cached entries.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock};

use super::core::CacheInner;
use super::record::RecordId;
use crate::types::Entry;

/// Lock mode for a borrow: shared reader or exclusive writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

impl AccessMode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            AccessMode::Read => "r",
            AccessMode::Write => "w",
        }
    }
}

/// The held per-entry lock, in whichever mode the borrow was taken.
pub(crate) enum PayloadGuard {
    Read(ArcRwLockReadGuard<RawRwLock, Entry>),
    Write(ArcRwLockWriteGuard<RawRwLock, Entry>),
}

impl PayloadGuard {
    fn entry(&self) -> &Entry {
        match self {
            PayloadGuard::Read(g) => g,
            PayloadGuard::Write(g) => g,
        }
    }
}

/// An outstanding borrow of a cached entry.
///
/// The guard holds the per-entry lock in the mode requested from
/// [`add`](super::EntryCache::add) or [`find_by_id`](super::EntryCache::find_by_id)
/// and keeps the record's refcount raised. Dropping the guard returns the
/// borrow: the lock is released, the refcount drops, and any pending
/// deletion completes. The return-after-use contract is therefore impossible
/// to forget.
///
/// A producer that inserted the entry must call [`commit`](Self::commit)
/// before dropping the guard; dropping an uncommitted guard removes the
/// record again. Use [`abandon`](Self::abandon) instead of a plain drop to
/// take the payload back in that case: a plain drop leaves no caller to
/// receive the payload, so ownership destroys it along with the record
/// (logged at `warn!` level).
pub struct EntryGuard {
    pub(crate) inner: Arc<Mutex<CacheInner>>,
    pub(crate) record: RecordId,
    pub(crate) mode: AccessMode,
    pub(crate) payload: Option<PayloadGuard>,
    pub(crate) returned: bool,
}

impl EntryGuard {
    #[must_use]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    #[must_use]
    pub fn entry(&self) -> &Entry {
        self.payload
            .as_ref()
            .expect("borrow active until guard is consumed")
            .entry()
    }

    /// Mutable payload access. `None` for read-mode borrows.
    pub fn entry_mut(&mut self) -> Option<&mut Entry> {
        match self.payload.as_mut() {
            Some(PayloadGuard::Write(g)) => Some(&mut **g),
            _ => None,
        }
    }

    /// Declare a `Creating` record valid.
    ///
    /// Distinguishes a successful creation from an abandonment, which are
    /// otherwise indistinguishable when the borrow returns: a committed
    /// record becomes `Ready` on return, an uncommitted one is removed.
    pub fn commit(&self) {
        let mut inner = self.inner.lock();
        inner.commit_record(self.record);
    }

    /// Return the borrow and reclaim the payload if this was the last
    /// reference to a record that is now gone from the cache.
    ///
    /// This is the abandonment path for a producer that inserted an entry
    /// and then decided not to commit it: the record is removed from the
    /// cache and the payload comes back to the caller. For any other borrow
    /// this behaves like a plain drop and returns `None`.
    pub fn abandon(mut self) -> Option<Entry> {
        self.finish(true)
    }

    fn finish(&mut self, reclaim: bool) -> Option<Entry> {
        if self.returned {
            return None;
        }
        self.returned = true;
        // Release the per-entry lock before taking the cache mutex. The lock
        // order permits the reverse, but nothing here needs the payload.
        drop(self.payload.take());
        let mut inner = self.inner.lock();
        inner.return_record(self.record, self.mode, reclaim)
    }
}

impl Deref for EntryGuard {
    type Target = Entry;

    fn deref(&self) -> &Entry {
        self.entry()
    }
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        self.finish(false);
    }
}

impl fmt::Debug for EntryGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryGuard")
            .field("id", &self.entry().id())
            .field("mode", &self.mode)
            .finish()
    }
}
