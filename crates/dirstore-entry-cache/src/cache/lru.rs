//! Intrusive LRU list over the record arena.
//!
//! The prev/next links live inside [`EntryRecord`], so splicing a record out
//! of the middle of the list is O(1) and needs no auxiliary lookup. Head is
//! the most recently used record, tail the least.

use std::collections::HashMap;

use super::record::{EntryRecord, RecordId};

pub(crate) type RecordArena = HashMap<RecordId, EntryRecord>;

#[derive(Debug, Default)]
pub(crate) struct LruList {
    pub(crate) head: Option<RecordId>,
    pub(crate) tail: Option<RecordId>,
}

impl LruList {
    /// Splice `id` in at the head. The record must be unlinked.
    pub(crate) fn push_head(&mut self, arena: &mut RecordArena, id: RecordId) {
        let old_head = self.head;
        let rec = arena.get_mut(&id).expect("lru: record resident in arena");
        rec.lru_prev = None;
        rec.lru_next = old_head;
        if let Some(h) = old_head {
            arena
                .get_mut(&h)
                .expect("lru: head resident in arena")
                .lru_prev = Some(id);
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
    }

    /// Splice `id` out, fixing the neighbors or the head/tail pointers.
    pub(crate) fn unlink(&mut self, arena: &mut RecordArena, id: RecordId) {
        let (prev, next) = {
            let rec = arena.get_mut(&id).expect("lru: record resident in arena");
            (rec.lru_prev.take(), rec.lru_next.take())
        };
        match prev {
            Some(p) => {
                arena
                    .get_mut(&p)
                    .expect("lru: prev resident in arena")
                    .lru_next = next;
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                arena
                    .get_mut(&n)
                    .expect("lru: next resident in arena")
                    .lru_prev = prev;
            }
            None => self.tail = prev,
        }
    }

    /// Move `id` to the head.
    pub(crate) fn touch(&mut self, arena: &mut RecordArena, id: RecordId) {
        self.unlink(arena, id);
        self.push_head(arena, id);
    }

    /// Snapshot of the list order, head to tail. Tests only.
    pub(crate) fn ids_head_to_tail(&self, arena: &RecordArena) -> Vec<RecordId> {
        let mut ids = Vec::new();
        let mut cur = self.head;
        while let Some(id) = cur {
            ids.push(id);
            cur = arena[&id].lru_next;
        }
        ids
    }
}
