//! Cache core: the cache mutex, the dual indices, and the public operations.
//!
//! # Lock hierarchy
//!
//! Two levels, in strict order. The cache mutex serializes every structural
//! change: both indices, the LRU list, the size counter, and each record's
//! state, refcount, and LRU links. The per-entry reader-writer lock guards
//! the payload for the duration of a borrow. The cache mutex may be taken
//! while holding a per-entry lock, but a per-entry lock is never acquired
//! blockingly under the cache mutex: [`EntryCache::find_by_id`] uses a
//! non-blocking try-acquire and yields on contention, which is the only
//! deadlock defense this design has, not an optimization.
//!
//! # Publication
//!
//! A record inserted by [`EntryCache::add`] starts in `Creating` state and
//! is invisible to lookups until the producer commits and returns its
//! borrow (`Creating -> Committed -> Ready`). Lookups that race with a
//! creation or a deletion see a non-`Ready` state, release the mutex, yield
//! and retry; progress is bounded by the producer finishing in finite time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use crate::config::CacheConfig;
use crate::error::{AddError, CacheError, CacheResult};
use crate::types::{Entry, EntryId, NormalizedDn};

use super::guard::{AccessMode, EntryGuard, PayloadGuard};
use super::lru::{LruList, RecordArena};
use super::metrics::CacheMetrics;
use super::record::{EntryRecord, EntryState, RecordId};

/// Maximum number of pinned tail records the eviction scan will parole
/// (splice back to the head) before giving up on making room.
const EVICTION_PAROLE_LIMIT: usize = 10;

/// Everything guarded by the cache mutex.
pub(crate) struct CacheInner {
    arena: RecordArena,
    dn_index: BTreeMap<NormalizedDn, RecordId>,
    id_index: BTreeMap<EntryId, RecordId>,
    lru: LruList,
    cursize: usize,
    max_entries: usize,
    next_record: u64,
    metrics: Arc<CacheMetrics>,
}

/// Take sole ownership of a payload whose record is gone and unborrowed.
fn unwrap_payload(payload: Arc<RwLock<Entry>>) -> Entry {
    Arc::try_unwrap(payload)
        .map(RwLock::into_inner)
        .expect("payload has no other owners")
}

impl CacheInner {
    fn alloc_record_id(&mut self) -> RecordId {
        self.next_record += 1;
        RecordId(self.next_record)
    }

    fn lru_push(&mut self, rid: RecordId) {
        self.lru.push_head(&mut self.arena, rid);
    }

    fn lru_unlink(&mut self, rid: RecordId) {
        self.lru.unlink(&mut self.arena, rid);
    }

    fn lru_touch(&mut self, rid: RecordId) {
        self.lru.touch(&mut self.arena, rid);
    }

    /// Unlink a record from both indices and the LRU list and mark it
    /// `Deleted`. The record stays in the arena until its last borrow
    /// returns; eviction removes it immediately because nothing holds it.
    fn delete_internal(&mut self, rid: RecordId) -> CacheResult<()> {
        let (key_id, key_ndn) = {
            let Some(rec) = self.arena.get(&rid) else {
                return Err(CacheError::Corrupted {
                    reason: "record missing from arena",
                });
            };
            (rec.key_id, rec.key_ndn.clone())
        };

        let mut ok = true;
        if self.dn_index.remove(&key_ndn).is_none() {
            ok = false;
        }
        if self.id_index.remove(&key_id).is_none() {
            ok = false;
        }
        if !ok {
            error!(id = %key_id, ndn = %key_ndn, "delete: record missing from an index");
            return Err(CacheError::Corrupted {
                reason: "record missing from an index",
            });
        }

        self.lru_unlink(rid);
        self.cursize -= 1;
        if let Some(rec) = self.arena.get_mut(&rid) {
            rec.state = EntryState::Deleted;
        }
        Ok(())
    }

    /// Two-phase eviction scan, run after any insertion that pushes the
    /// cache over its bound.
    fn enforce_capacity(&mut self) {
        // Parole pass: a pinned tail counts as recently used. Bounded so a
        // cache full of long-held borrows cannot spin here.
        let mut paroled = 0;
        while paroled < EVICTION_PAROLE_LIMIT {
            let Some(tail) = self.lru.tail else { return };
            if self.arena[&tail].refcnt == 0 {
                break;
            }
            self.lru_touch(tail);
            paroled += 1;
        }

        // Eviction pass: free unpinned tail records until back within
        // bounds. Stops at a pinned tail; the cache may stay over its bound
        // transiently rather than block.
        while self.cursize > self.max_entries {
            let Some(tail) = self.lru.tail else { break };
            let rec = &self.arena[&tail];
            if rec.refcnt != 0 {
                debug!(
                    cursize = self.cursize,
                    max_entries = self.max_entries,
                    "eviction stopped at pinned tail"
                );
                break;
            }
            let id = rec.key_id;
            if let Err(err) = self.delete_internal(tail) {
                error!(id = %id, error = %err, "eviction failed");
                break;
            }
            self.arena.remove(&tail);
            self.metrics.record_eviction();
            debug!(id = %id, cursize = self.cursize, "evicted entry");
        }
    }

    pub(super) fn commit_record(&mut self, rid: RecordId) {
        match self.arena.get_mut(&rid) {
            Some(rec) if rec.state == EntryState::Creating => {
                rec.state = EntryState::Committed;
                trace!(id = %rec.key_id, "committed entry");
            }
            Some(rec) => {
                debug_assert!(false, "commit on a non-creating record");
                warn!(
                    id = %rec.key_id,
                    state = rec.state.as_str(),
                    "commit ignored: record not in creating state"
                );
            }
            None => error!("commit on a record missing from the arena"),
        }
    }

    /// Return a borrow: drop the refcount and finish whatever the record's
    /// state demands. Called from the guard with the per-entry lock already
    /// released.
    ///
    /// Returns the payload only on the reclaim path, when the record is
    /// gone from the cache and this was its last borrow.
    pub(super) fn return_record(
        &mut self,
        rid: RecordId,
        mode: AccessMode,
        reclaim: bool,
    ) -> Option<Entry> {
        let (id, refcnt, state_at_return) = {
            let Some(rec) = self.arena.get_mut(&rid) else {
                error!("returned a borrow for a record missing from the arena");
                return None;
            };
            debug_assert!(rec.refcnt > 0, "refcount underflow");
            rec.refcnt = rec.refcnt.saturating_sub(1);
            (rec.key_id, rec.refcnt, rec.state)
        };

        // An uncommitted creation is removed again on return. The payload
        // belongs to the producer in that case, not the cache; a plain drop
        // leaves no producer to receive it, so ownership destroys it.
        if state_at_return == EntryState::Creating {
            if !reclaim {
                warn!(
                    id = %id,
                    "uncommitted entry dropped without reclaim; its payload is destroyed"
                );
            }
            if let Err(err) = self.delete_internal(rid) {
                error!(id = %id, error = %err, "abandoned creation could not be unlinked");
            }
        }

        let state = self.arena.get(&rid).map(|rec| rec.state);
        match state {
            Some(EntryState::Committed) => {
                if let Some(rec) = self.arena.get_mut(&rid) {
                    rec.state = EntryState::Ready;
                }
                trace!(id = %id, mode = mode.as_str(), refcnt, "returned entry: created");
                None
            }
            Some(EntryState::Deleted) if refcnt > 0 => {
                trace!(id = %id, mode = mode.as_str(), refcnt, "returned entry: delete pending");
                None
            }
            Some(EntryState::Deleted) => {
                let rec = self.arena.remove(&rid)?;
                trace!(id = %id, mode = mode.as_str(), "returned entry: destroyed");
                if reclaim {
                    Some(unwrap_payload(rec.payload))
                } else {
                    None
                }
            }
            Some(_) => {
                trace!(id = %id, mode = mode.as_str(), refcnt, "returned entry");
                None
            }
            None => None,
        }
    }
}

/// Shared handle to the entry cache.
///
/// Cloning is cheap; all clones operate on the same cache.
#[derive(Clone)]
pub struct EntryCache {
    inner: Arc<Mutex<CacheInner>>,
    metrics: Arc<CacheMetrics>,
    config: CacheConfig,
}

impl EntryCache {
    /// Create a cache bounded at `config.max_entries` resident entries.
    ///
    /// # Errors
    /// Returns `CacheError::Config` if the configuration fails validation.
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        let metrics = Arc::new(CacheMetrics::new());
        let inner = CacheInner {
            arena: RecordArena::new(),
            dn_index: BTreeMap::new(),
            id_index: BTreeMap::new(),
            lru: LruList::default(),
            cursize: 0,
            max_entries: config.max_entries,
            next_record: 0,
            metrics: Arc::clone(&metrics),
        };
        debug!(max_entries = config.max_entries, "entry cache created");
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
            metrics,
            config,
        })
    }

    /// Insert a new entry and borrow it in `mode`.
    ///
    /// The record starts in `Creating` state: it occupies both indices and
    /// the LRU head but is invisible to lookups until the caller commits and
    /// drops the guard. A caller that drops (or [`abandon`]s) the guard
    /// without committing removes the record again.
    ///
    /// [`abandon`]: EntryGuard::abandon
    ///
    /// # Errors
    /// Returns the payload back inside [`AddError`] when either key is
    /// already cached, or when the rollback of a half-done insertion fails.
    pub fn add(&self, entry: Entry, mode: AccessMode) -> Result<EntryGuard, AddError> {
        let id = entry.id();
        let ndn = entry.ndn().clone();
        trace!(id = %id, ndn = %ndn, mode = mode.as_str(), "add entry");

        // The producer takes the payload lock before the record is
        // published, so this acquisition can never contend.
        let payload = Arc::new(RwLock::new(entry));
        let lock = match mode {
            AccessMode::Read => PayloadGuard::Read(payload.read_arc()),
            AccessMode::Write => PayloadGuard::Write(payload.write_arc()),
        };

        let mut inner = self.inner.lock();

        if inner.dn_index.contains_key(&ndn) {
            drop(inner);
            drop(lock);
            debug!(id = %id, ndn = %ndn, "add: already in dn cache");
            return Err(AddError {
                kind: CacheError::Duplicate { id, ndn },
                entry: unwrap_payload(payload),
            });
        }
        let rid = inner.alloc_record_id();
        inner.dn_index.insert(ndn.clone(), rid);

        if inner.id_index.contains_key(&id) {
            // Undo the dn insertion made above.
            let rolled_back = inner.dn_index.remove(&ndn).is_some();
            drop(inner);
            drop(lock);
            debug!(id = %id, ndn = %ndn, "add: already in id cache");
            let entry = unwrap_payload(payload);
            if !rolled_back {
                error!(id = %id, ndn = %ndn, "add: dn index entry vanished during rollback");
                return Err(AddError {
                    kind: CacheError::Corrupted {
                        reason: "dn index entry vanished during rollback",
                    },
                    entry,
                });
            }
            return Err(AddError {
                kind: CacheError::Duplicate { id, ndn },
                entry,
            });
        }
        inner.id_index.insert(id, rid);

        inner.arena.insert(
            rid,
            EntryRecord::new_creating(id, ndn, Arc::clone(&payload)),
        );
        inner.lru_push(rid);
        inner.cursize += 1;
        if inner.cursize > inner.max_entries {
            inner.enforce_capacity();
        }
        drop(inner);

        Ok(EntryGuard {
            inner: Arc::clone(&self.inner),
            record: rid,
            mode,
            payload: Some(lock),
            returned: false,
        })
    }

    /// Re-insert a deleted entry whose borrow the caller still holds.
    ///
    /// This is the rename flow: find the entry, [`delete`](Self::delete) it,
    /// rekey the payload under the write borrow, then `update` to re-insert
    /// it under its new keys. The record re-enters `Creating` state; the
    /// caller's existing borrow continues, so no lock is re-acquired and the
    /// refcount is untouched. Commit and drop the guard as after `add`.
    ///
    /// # Errors
    /// `Duplicate` if either new key is already cached (the borrow stays
    /// valid); `Corrupted` if rollback of a half-done insertion fails.
    pub fn update(&self, guard: &EntryGuard) -> CacheResult<()> {
        debug_assert!(
            Arc::ptr_eq(&self.inner, &guard.inner),
            "guard belongs to another cache"
        );
        let id = guard.entry().id();
        let ndn = guard.entry().ndn().clone();
        let rid = guard.record;

        let mut inner = self.inner.lock();
        trace!(id = %id, ndn = %ndn, "update entry");

        let Some(state) = inner.arena.get(&rid).map(|rec| rec.state) else {
            return Err(CacheError::Corrupted {
                reason: "borrowed record missing from arena",
            });
        };
        debug_assert_eq!(
            state,
            EntryState::Deleted,
            "update requires a deleted record"
        );

        if inner.dn_index.contains_key(&ndn) {
            debug!(id = %id, ndn = %ndn, "update: already in dn cache");
            return Err(CacheError::Duplicate { id, ndn });
        }
        inner.dn_index.insert(ndn.clone(), rid);

        if inner.id_index.contains_key(&id) {
            debug!(id = %id, ndn = %ndn, "update: already in id cache");
            if inner.dn_index.remove(&ndn).is_none() {
                error!(id = %id, ndn = %ndn, "update: dn index entry vanished during rollback");
                return Err(CacheError::Corrupted {
                    reason: "dn index entry vanished during rollback",
                });
            }
            return Err(CacheError::Duplicate { id, ndn });
        }
        inner.id_index.insert(id, rid);

        if let Some(rec) = inner.arena.get_mut(&rid) {
            rec.state = EntryState::Creating;
            rec.key_id = id;
            rec.key_ndn = ndn;
        }
        inner.lru_push(rid);
        inner.cursize += 1;
        if inner.cursize > inner.max_entries {
            inner.enforce_capacity();
        }
        Ok(())
    }

    /// Resolve a normalized DN to an entry id.
    ///
    /// Takes no per-entry lock and raises no refcount: the id is read under
    /// the cache mutex alone, and the record is only touched in the LRU.
    /// The returned id is a hint, not a guarantee; the entry may be evicted
    /// or deleted before a subsequent [`find_by_id`](Self::find_by_id) pins
    /// it.
    ///
    /// Retries (releasing the mutex and yielding in between) while the
    /// record is not yet `Ready`.
    pub fn find_by_dn(&self, ndn: &NormalizedDn) -> Option<EntryId> {
        let mut tries = 0u32;
        loop {
            tries += 1;
            let mut inner = self.inner.lock();
            let Some(&rid) = inner.dn_index.get(ndn) else {
                drop(inner);
                self.metrics.record_miss();
                trace!(ndn = %ndn, "find_by_dn: not cached");
                return None;
            };
            let Some(rec) = inner.arena.get(&rid) else {
                error!(ndn = %ndn, "find_by_dn: dn index points at a missing record");
                return None;
            };
            let (id, state) = (rec.key_id, rec.state);

            // Deleted or not fully created yet: wait for state progress.
            if state != EntryState::Ready {
                drop(inner);
                trace!(
                    ndn = %ndn,
                    id = %id,
                    state = state.as_str(),
                    tries,
                    "find_by_dn: not ready, retrying"
                );
                self.metrics.record_retry();
                thread::yield_now();
                continue;
            }

            inner.lru_touch(rid);
            drop(inner);
            self.metrics.record_hit();
            trace!(ndn = %ndn, id = %id, tries, "find_by_dn: resolved");
            return Some(id);
        }
    }

    /// Look up an entry by id and borrow it in `mode`.
    ///
    /// On success the record is moved to the LRU head, its refcount rises,
    /// and the guard holds the per-entry lock in `mode`. Retries (releasing
    /// the mutex and yielding in between) while the record is not yet
    /// `Ready` or while its per-entry lock is contended; the lock is never
    /// acquired blockingly under the cache mutex.
    pub fn find_by_id(&self, id: EntryId, mode: AccessMode) -> Option<EntryGuard> {
        let mut tries = 0u32;
        loop {
            tries += 1;
            let mut inner = self.inner.lock();
            let Some(&rid) = inner.id_index.get(&id) else {
                drop(inner);
                self.metrics.record_miss();
                trace!(id = %id, "find_by_id: not cached");
                return None;
            };
            let Some(rec) = inner.arena.get(&rid) else {
                error!(id = %id, "find_by_id: id index points at a missing record");
                return None;
            };
            let state = rec.state;

            if state != EntryState::Ready {
                drop(inner);
                trace!(
                    id = %id,
                    state = state.as_str(),
                    tries,
                    "find_by_id: not ready, retrying"
                );
                self.metrics.record_retry();
                thread::yield_now();
                continue;
            }

            // The holder of this lock may itself be waiting for the cache
            // mutex, so only a non-blocking acquisition is safe here.
            let payload = Arc::clone(&rec.payload);
            let lock = match mode {
                AccessMode::Read => payload.try_read_arc().map(PayloadGuard::Read),
                AccessMode::Write => payload.try_write_arc().map(PayloadGuard::Write),
            };
            let Some(lock) = lock else {
                drop(inner);
                trace!(id = %id, mode = mode.as_str(), tries, "find_by_id: busy, retrying");
                self.metrics.record_retry();
                thread::yield_now();
                continue;
            };

            inner.lru_touch(rid);
            if let Some(rec) = inner.arena.get_mut(&rid) {
                rec.refcnt += 1;
            }
            drop(inner);
            self.metrics.record_hit();
            trace!(id = %id, mode = mode.as_str(), tries, "find_by_id: found");
            return Some(EntryGuard {
                inner: Arc::clone(&self.inner),
                record: rid,
                mode,
                payload: Some(lock),
                returned: false,
            });
        }
    }

    /// Remove a borrowed entry from the cache.
    ///
    /// The caller must hold `guard` from a `find_by_id` (or `add`); the
    /// borrow stays outstanding afterwards. The record is unlinked from both
    /// indices and the LRU list immediately and freed when the last borrow
    /// returns, unless [`update`](Self::update) re-inserts it first.
    ///
    /// # Errors
    /// `NotFound` if the record was already deleted; `Corrupted` if it was
    /// resident in one index but not the other.
    pub fn delete(&self, guard: &EntryGuard) -> CacheResult<()> {
        debug_assert!(
            Arc::ptr_eq(&self.inner, &guard.inner),
            "guard belongs to another cache"
        );
        let mut inner = self.inner.lock();
        let Some(rec) = inner.arena.get(&guard.record) else {
            return Err(CacheError::Corrupted {
                reason: "borrowed record missing from arena",
            });
        };
        trace!(id = %rec.key_id, "delete entry");
        if rec.state == EntryState::Deleted {
            return Err(CacheError::NotFound);
        }
        inner.delete_internal(guard.record)
    }

    /// Destroy every unpinned record. Used at shutdown.
    ///
    /// Returns the number of records left resident because a borrow was
    /// still outstanding; a nonzero return means callers leaked borrows.
    pub fn release_all(&self) -> usize {
        let mut inner = self.inner.lock();
        debug!("release_all");
        let mut cur = inner.lru.tail;
        while let Some(rid) = cur {
            let (prev, refcnt, id) = {
                let rec = &inner.arena[&rid];
                (rec.lru_prev, rec.refcnt, rec.key_id)
            };
            cur = prev;
            if refcnt != 0 {
                continue;
            }
            if let Err(err) = inner.delete_internal(rid) {
                error!(id = %id, error = %err, "release_all: could not unlink record");
                continue;
            }
            inner.arena.remove(&rid);
        }
        let remaining = inner.cursize;
        if remaining > 0 {
            warn!(remaining, "entry cache could not be emptied");
        }
        remaining
    }

    /// Number of resident entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().cursize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The configured residency bound.
    #[must_use]
    pub fn max_entries(&self) -> usize {
        self.config.max_entries
    }

    /// Membership probe by id. Does not touch the LRU or pin the record.
    #[must_use]
    pub fn contains_id(&self, id: EntryId) -> bool {
        self.inner.lock().id_index.contains_key(&id)
    }

    /// Membership probe by normalized DN. Does not touch the LRU or pin the
    /// record.
    #[must_use]
    pub fn contains_dn(&self, ndn: &NormalizedDn) -> bool {
        self.inner.lock().dn_index.contains_key(ndn)
    }

    #[must_use]
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Entry ids in LRU order, head (most recent) first.
    #[cfg(test)]
    pub(crate) fn lru_entry_ids(&self) -> Vec<EntryId> {
        let inner = self.inner.lock();
        inner
            .lru
            .ids_head_to_tail(&inner.arena)
            .into_iter()
            .map(|rid| inner.arena[&rid].key_id)
            .collect()
    }

    /// Check every structural invariant under the cache mutex.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let inner = self.inner.lock();
        assert_eq!(inner.dn_index.len(), inner.cursize, "dn index size");
        assert_eq!(inner.id_index.len(), inner.cursize, "id index size");

        for (ndn, rid) in &inner.dn_index {
            let rec = inner
                .arena
                .get(rid)
                .expect("dn index points at a resident record");
            assert_eq!(&rec.key_ndn, ndn, "dn key snapshot matches index");
            assert_ne!(rec.state, EntryState::Deleted, "indexed record not deleted");
        }
        for (id, rid) in &inner.id_index {
            let rec = inner
                .arena
                .get(rid)
                .expect("id index points at a resident record");
            assert_eq!(&rec.key_id, id, "id key snapshot matches index");
        }

        // LRU membership equals the index key sets and the links are
        // consistent in both directions.
        let forward = inner.lru.ids_head_to_tail(&inner.arena);
        assert_eq!(forward.len(), inner.cursize, "lru membership");
        let mut prev = None;
        for rid in &forward {
            let rec = &inner.arena[rid];
            assert_eq!(rec.lru_prev, prev, "lru back link");
            assert_eq!(inner.id_index.get(&rec.key_id), Some(rid), "lru record indexed");
            prev = Some(*rid);
        }
        assert_eq!(inner.lru.tail, prev, "lru tail");

        // Arena records outside the indices are delete-pending borrows.
        for (rid, rec) in &inner.arena {
            if inner.id_index.get(&rec.key_id) != Some(rid) {
                assert_eq!(rec.state, EntryState::Deleted, "unindexed record deleted");
                assert!(rec.refcnt > 0, "unindexed record still borrowed");
            }
        }
    }
}
