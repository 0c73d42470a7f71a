//! Cache configuration.

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

fn default_max_entries() -> usize {
    1000
}

/// Configuration for the entry cache.
///
/// `max_entries` bounds residency, not admission: an insertion always
/// succeeds, and the eviction scan then removes least-recently-used records
/// until the cache is back within bounds. When every resident record is
/// pinned by a borrower the cache exceeds the bound transiently rather than
/// block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of resident entries before the eviction scan runs.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

impl CacheConfig {
    /// Fail-fast validation, run by [`EntryCache::new`](crate::EntryCache::new).
    ///
    /// # Errors
    /// Returns `CacheError::Config` if `max_entries` is zero: a zero bound
    /// would evict every entry the moment it was returned.
    pub fn validate(&self) -> CacheResult<()> {
        if self.max_entries == 0 {
            return Err(CacheError::Config {
                message: "max_entries cannot be 0".to_string(),
            });
        }
        Ok(())
    }
}
