//! Index Layer
//!
//! Concurrent indices over entity snapshots. Every index is a sharded map
//! with one `RwLock` per shard, so readers never contend on a global lock.
//!
//! | Index                    | Bucket holds          | Used for                         |
//! |--------------------------|-----------------------|----------------------------------|
//! | `SemiUniqueDatedIndex`   | version chain         | primary index of every cache     |
//! | `UniqueIndex`            | one snapshot          | unique secondaries, non-dated    |
//! | `NonUniqueIndex`         | snapshots by value    | non-unique secondaries, non-dated|
//! | `NonUniqueIdentityIndex` | snapshots by instance | non-unique secondaries, dated    |

mod identity;
mod non_unique;
mod reference;
mod semi_unique;
mod shard;
mod string_index;
mod unique;

use std::sync::Arc;

use crate::error::Result;
use crate::model::{Extractor, IndexKey, Snapshot};

pub use identity::NonUniqueIdentityIndex;
pub use non_unique::NonUniqueIndex;
pub use reference::{IndexReference, PRIMARY_SLOT};
pub(crate) use reference::next_cache_id;
pub use semi_unique::{SemiUniqueDatedIndex, VersionChain};
pub use shard::{Shard, ShardWriteSet, ShardedMap, DEFAULT_SHARD_COUNT};
pub use string_index::{polynomial_hash, StringHandle, StringHashFn, StringIndex};
pub use unique::UniqueIndex;

/// Common surface of the snapshot indices
pub trait SnapshotIndex: Send + Sync {
    /// Index name
    fn name(&self) -> &str;

    /// Attributes forming the key
    fn extractors(&self) -> &[Extractor];

    /// At most one snapshot per key at any point of the milestoning plane
    fn is_unique(&self) -> bool;

    /// Insert a snapshot
    fn put(&self, snapshot: Arc<Snapshot>) -> Result<()>;

    /// All snapshots under a key
    fn get(&self, key: &IndexKey) -> Vec<Arc<Snapshot>>;

    /// Remove by identity and rectangle
    fn remove(&self, snapshot: &Snapshot) -> Result<bool>;

    /// Number of snapshots
    fn len(&self) -> usize;

    /// Number of distinct keys
    fn key_count(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self);
}

/// Same identity and rectangle
pub(crate) fn same_version(a: &Snapshot, b: &Snapshot) -> bool {
    a.identity() == b.identity() && a.rectangle() == b.rectangle()
}
