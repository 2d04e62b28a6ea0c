//! Sharded Map Implementation
//!
//! Concurrent hashmap keyed by [`IndexKey`] with one `RwLock` per shard.
//!
//! # Design
//!
//! - Each shard has its own RwLock, minimizing contention
//! - Power-of-2 shard count enables fast modulo via bitwise AND
//! - Keys carry their hash, so routing never rehashes the attribute tuple
//! - Shards are cache-line padded to prevent false sharing

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::model::IndexKey;

/// Default shard count for index maps
pub const DEFAULT_SHARD_COUNT: usize = 64;

/// Single shard containing a hashmap and statistics
pub struct Shard<V> {
    /// The hashmap for this shard
    map: RwLock<HashMap<IndexKey, V>>,
    /// Number of reads
    reads: AtomicU64,
    /// Number of writes
    writes: AtomicU64,
}

impl<V> Default for Shard<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Shard<V> {
    /// Create a new empty shard
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Shared access to the shard's map
    pub fn read(&self) -> RwLockReadGuard<'_, HashMap<IndexKey, V>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.map.read()
    }

    /// Exclusive access to the shard's map
    pub fn write(&self) -> RwLockWriteGuard<'_, HashMap<IndexKey, V>> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.map.write()
    }

    /// Number of keys in this shard
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get read count
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Get write count
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

/// Sharded map with a runtime power-of-two shard count
pub struct ShardedMap<V> {
    shards: Box<[CachePadded<Shard<V>>]>,
    mask: usize,
}

impl<V> Default for ShardedMap<V> {
    fn default() -> Self {
        Self::new(DEFAULT_SHARD_COUNT)
    }
}

impl<V> ShardedMap<V> {
    /// Create a map; `shard_count` is rounded up to a power of two
    pub fn new(shard_count: usize) -> Self {
        let count = shard_count.max(1).next_power_of_two();
        let shards = (0..count)
            .map(|_| CachePadded::new(Shard::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            mask: count - 1,
        }
    }

    #[inline]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard owning `key`
    #[inline]
    pub fn shard_for(&self, key: &IndexKey) -> &Shard<V> {
        &self.shards[(key.combined_hash() as usize) & self.mask]
    }

    /// Position of the shard owning `key`
    #[inline]
    pub fn shard_index(&self, key: &IndexKey) -> usize {
        (key.combined_hash() as usize) & self.mask
    }

    /// Shard by position
    #[inline]
    pub fn shard(&self, index: usize) -> &Shard<V> {
        &self.shards[index & self.mask]
    }

    pub fn shards(&self) -> impl Iterator<Item = &Shard<V>> {
        self.shards.iter().map(|s| &**s)
    }

    /// Total number of keys across all shards
    pub fn len(&self) -> usize {
        self.shards().map(Shard::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards().all(Shard::is_empty)
    }

    /// Get total read count
    pub fn total_reads(&self) -> u64 {
        self.shards().map(Shard::read_count).sum()
    }

    /// Get total write count
    pub fn total_writes(&self) -> u64 {
        self.shards().map(Shard::write_count).sum()
    }

    /// Read the value under `key`
    pub fn with<R>(&self, key: &IndexKey, f: impl FnOnce(Option<&V>) -> R) -> R {
        let guard = self.shard_for(key).read();
        f(guard.get(key))
    }

    /// Mutate the map slot of `key` under the shard write lock
    pub fn with_mut<R>(&self, key: &IndexKey, f: impl FnOnce(&mut HashMap<IndexKey, V>) -> R) -> R {
        let mut guard = self.shard_for(key).write();
        f(&mut guard)
    }

    /// Write-lock every shard owning one of `keys`, in ascending shard
    /// position, and hold them together
    pub fn write_many<'k>(
        &self,
        keys: impl IntoIterator<Item = &'k IndexKey>,
    ) -> ShardWriteSet<'_, V> {
        let mut positions: Vec<usize> = keys.into_iter().map(|k| self.shard_index(k)).collect();
        positions.sort_unstable();
        positions.dedup();
        ShardWriteSet {
            mask: self.mask,
            guards: positions
                .into_iter()
                .map(|p| (p, self.shards[p].write()))
                .collect(),
        }
    }

    /// Clear all shards
    pub fn clear(&self) {
        for shard in self.shards() {
            shard.write().clear();
        }
    }

    /// Collect over every value, one shard at a time
    pub fn collect<T>(&self, mut f: impl FnMut(&IndexKey, &V, &mut Vec<T>)) -> Vec<T> {
        let mut out = Vec::new();
        for shard in self.shards() {
            let guard = shard.read();
            for (key, value) in guard.iter() {
                f(key, value, &mut out);
            }
        }
        out
    }
}

/// Write guards over several shards, released together on drop
pub struct ShardWriteSet<'a, V> {
    mask: usize,
    guards: Vec<(usize, RwLockWriteGuard<'a, HashMap<IndexKey, V>>)>,
}

impl<V> ShardWriteSet<'_, V> {
    /// Map of the shard owning `key`; `None` when that shard is not held
    pub fn map_for(&mut self, key: &IndexKey) -> Option<&mut HashMap<IndexKey, V>> {
        let position = (key.combined_hash() as usize) & self.mask;
        let slot = self
            .guards
            .binary_search_by_key(&position, |(p, _)| *p)
            .ok()?;
        Some(&mut *self.guards[slot].1)
    }

    /// Number of shards held
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_count_rounded_to_power_of_two() {
        let map: ShardedMap<u32> = ShardedMap::new(10);
        assert_eq!(map.shard_count(), 16);
        let map: ShardedMap<u32> = ShardedMap::new(0);
        assert_eq!(map.shard_count(), 1);
    }

    #[test]
    fn test_basic_operations() {
        let map: ShardedMap<u32> = ShardedMap::new(8);
        let key = IndexKey::single(1);
        map.with_mut(&key, |m| m.insert(key.clone(), 7));
        assert_eq!(map.with(&key, |v| v.copied()), Some(7));
        assert_eq!(map.len(), 1);
        assert!(map.total_reads() >= 1);
        assert!(map.total_writes() >= 1);

        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.with(&key, |v| v.copied()), None);
    }

    #[test]
    fn test_write_many_holds_each_owning_shard_once() {
        let map: ShardedMap<u32> = ShardedMap::new(4);
        let keys: Vec<IndexKey> = (0..32).map(IndexKey::single).collect();
        {
            let mut set = map.write_many(&keys);
            assert!(set.len() <= map.shard_count());
            for (n, key) in keys.iter().enumerate() {
                set.map_for(key).unwrap().insert(key.clone(), n as u32);
            }
        }
        assert_eq!(map.len(), 32);
        assert_eq!(map.with(&keys[5], |v| v.copied()), Some(5));

        let one = [IndexKey::single(1)];
        let mut set = map.write_many(&one);
        assert_eq!(set.len(), 1);
        let other = (2..64)
            .map(IndexKey::single)
            .find(|k| map.shard_index(k) != map.shard_index(&one[0]))
            .unwrap();
        assert!(set.map_for(&other).is_none());
    }

    #[test]
    fn test_concurrent_writers() {
        use std::sync::Arc;
        use std::thread;

        let map: Arc<ShardedMap<u64>> = Arc::new(ShardedMap::new(16));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..250u64 {
                        let key = IndexKey::single((t * 1000 + i) as i64);
                        map.with_mut(&key, |m| m.insert(key.clone(), i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(map.len(), 1000);
    }
}
