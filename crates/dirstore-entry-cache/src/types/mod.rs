//! Entry payload types shared between the backing store and the cache.

mod entry;

pub use entry::{Attribute, Entry, EntryId, NormalizedDn};
