//! The directory entry payload and its two cache keys.

use std::fmt;

/// Numeric entry identifier assigned by the backing store.
///
/// Zero is reserved as "no such id" and never names a real entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(u64);

impl EntryId {
    /// Reserved sentinel: no entry carries this id.
    pub const NONE: EntryId = EntryId(0);

    #[must_use]
    pub const fn new(raw: u64) -> Self {
        EntryId(raw)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// True for the reserved zero id.
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for EntryId {
    fn from(raw: u64) -> Self {
        EntryId(raw)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonicalized DN byte form used for equality and ordering.
///
/// Produced by the external DN normalizer before it reaches the cache; the
/// cache only compares it, lexicographically over bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NormalizedDn(Vec<u8>);

impl NormalizedDn {
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        NormalizedDn(bytes.into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for NormalizedDn {
    fn from(s: &str) -> Self {
        NormalizedDn(s.as_bytes().to_vec())
    }
}

impl fmt::Display for NormalizedDn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Single attribute of a directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<String>,
}

impl Attribute {
    #[must_use]
    pub fn new(name: impl Into<String>, values: Vec<String>) -> Self {
        Attribute {
            name: name.into(),
            values,
        }
    }
}

/// A directory entry as cached.
///
/// The cache reads only `id` and `ndn`; the display DN and the attributes
/// are opaque payload, mutated by callers under a write borrow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    id: EntryId,
    dn: String,
    ndn: NormalizedDn,
    attributes: Vec<Attribute>,
}

impl Entry {
    #[must_use]
    pub fn new(id: EntryId, dn: impl Into<String>, ndn: NormalizedDn) -> Self {
        Entry {
            id,
            dn: dn.into(),
            ndn,
            attributes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: Vec<Attribute>) -> Self {
        self.attributes = attributes;
        self
    }

    #[must_use]
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Display form of the DN. Unused by the cache itself.
    #[must_use]
    pub fn dn(&self) -> &str {
        &self.dn
    }

    #[must_use]
    pub fn ndn(&self) -> &NormalizedDn {
        &self.ndn
    }

    #[must_use]
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut Vec<Attribute> {
        &mut self.attributes
    }

    /// Rekey the entry under a new DN.
    ///
    /// Used by rename flows: the caller deletes the cached record, rekeys the
    /// payload under its write borrow, then re-inserts it.
    pub fn set_dn(&mut self, dn: impl Into<String>, ndn: NormalizedDn) {
        self.dn = dn.into();
        self.ndn = ndn;
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.dn, self.id)
    }
}
