//! Index references
//!
//! An [`IndexReference`] names one index slot of one cache instance. Slot 1
//! is always the primary index; secondaries follow in declaration order.
//! Slots below 1 never identify an index.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::{Error, Result};

/// Slot of the primary (identity) index
pub const PRIMARY_SLOT: i32 = 1;

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique cache instance id
pub(crate) fn next_cache_id() -> u64 {
    NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Binds a cache instance to one of its index slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct IndexReference {
    cache_id: u64,
    slot: i32,
}

impl IndexReference {
    pub fn new(cache_id: u64, slot: i32) -> Self {
        Self { cache_id, slot }
    }

    /// A reference no cache will accept
    pub fn invalid() -> Self {
        Self {
            cache_id: 0,
            slot: 0,
        }
    }

    pub fn cache_id(&self) -> u64 {
        self.cache_id
    }

    pub fn slot(&self) -> i32 {
        self.slot
    }

    /// Slot names a real index
    pub fn is_valid(&self) -> bool {
        self.slot >= PRIMARY_SLOT
    }

    /// Issued by the cache with this id
    pub fn is_for_cache(&self, cache_id: u64) -> bool {
        self.cache_id == cache_id
    }

    /// Check the reference can be used against `cache_id` and return the
    /// zero-based position of its index
    pub fn position_in(&self, cache_id: u64, slots: usize) -> Result<usize> {
        if !self.is_valid() {
            return Err(self.stale("slot must be at least 1"));
        }
        if !self.is_for_cache(cache_id) {
            return Err(self.stale(&format!(
                "reference was issued by another cache, not {}",
                cache_id
            )));
        }
        let position = (self.slot - PRIMARY_SLOT) as usize;
        if position >= slots {
            return Err(self.stale(&format!("cache only has {} index slots", slots)));
        }
        Ok(position)
    }

    fn stale(&self, reason: &str) -> Error {
        Error::StaleReference {
            cache_id: self.cache_id,
            slot: self.slot,
            reason: reason.to_string(),
        }
    }
}
