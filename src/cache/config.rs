//! Cache configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::index::DEFAULT_SHARD_COUNT;

/// How a cache is populated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Every row is bulk loaded up front; a miss means "does not exist"
    #[default]
    Full,
    /// Populated lazily per query; a miss consults the data source
    Partial,
}

impl std::fmt::Display for CacheMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheMode::Full => write!(f, "full"),
            CacheMode::Partial => write!(f, "partial"),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Shards per index (rounded up to a power of two)
    pub shard_count: usize,
    /// Full or partial population
    pub mode: CacheMode,
    /// String attributes routed through the interning index
    pub interned_attributes: Vec<String>,
    /// Number of per-identity write lock stripes
    pub lock_stripes: usize,
    /// Lock wait for direct (non-transactional) mutations
    pub lock_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
            mode: CacheMode::Full,
            interned_attributes: Vec::new(),
            lock_stripes: 256,
            lock_timeout_ms: 5_000,
        }
    }
}

impl CacheConfig {
    /// Partial cache with otherwise default settings
    pub fn partial() -> Self {
        Self {
            mode: CacheMode::Partial,
            ..Self::default()
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(Error::Config("shard_count must be > 0".into()));
        }
        if self.lock_stripes == 0 {
            return Err(Error::Config("lock_stripes must be > 0".into()));
        }
        if self.lock_timeout_ms == 0 {
            return Err(Error::Config("lock_timeout_ms must be > 0".into()));
        }
        Ok(())
    }
}
