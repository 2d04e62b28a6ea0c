//! Non-unique identity index
//!
//! Buckets are keyed by attribute value but hold snapshots by object
//! identity: two distinct snapshot instances with equal content both stay.
//! The index keeps running totals so the average bucket size is available
//! in O(1) after every mutation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::shard::ShardedMap;
use super::{same_version, SnapshotIndex};
use crate::error::Result;
use crate::model::{extract_key, Extractor, IndexKey, Snapshot};

pub struct NonUniqueIdentityIndex {
    name: String,
    extractors: Vec<Extractor>,
    map: ShardedMap<Vec<Arc<Snapshot>>>,
    /// Total snapshots across all buckets
    unique_size: AtomicUsize,
    /// Number of non-empty buckets
    non_unique_size: AtomicUsize,
}

impl NonUniqueIdentityIndex {
    pub fn new(name: impl Into<String>, extractors: Vec<Extractor>, shard_count: usize) -> Self {
        Self {
            name: name.into(),
            extractors,
            map: ShardedMap::new(shard_count),
            unique_size: AtomicUsize::new(0),
            non_unique_size: AtomicUsize::new(0),
        }
    }

    pub fn unique_size(&self) -> usize {
        self.unique_size.load(Ordering::Acquire)
    }

    pub fn non_unique_size(&self) -> usize {
        self.non_unique_size.load(Ordering::Acquire)
    }

    /// Snapshots per key, rounded up; 0 when empty
    pub fn average_bucket_size(&self) -> usize {
        let keys = self.non_unique_size();
        if keys == 0 {
            return 0;
        }
        self.unique_size().div_ceil(keys)
    }

    /// Remove one exact instance
    pub fn remove_instance(&self, snapshot: &Arc<Snapshot>) -> Result<bool> {
        let key = extract_key(&self.extractors, snapshot)?;
        Ok(self.remove_where(&key, |s| Arc::ptr_eq(s, snapshot)))
    }

    fn remove_where(&self, key: &IndexKey, pred: impl Fn(&Arc<Snapshot>) -> bool) -> bool {
        self.map.with_mut(key, |map| {
            let Some(bucket) = map.get_mut(key) else {
                return false;
            };
            let Some(position) = bucket.iter().position(pred) else {
                return false;
            };
            bucket.swap_remove(position);
            self.unique_size.fetch_sub(1, Ordering::AcqRel);
            if bucket.is_empty() {
                map.remove(key);
                self.non_unique_size.fetch_sub(1, Ordering::AcqRel);
            }
            true
        })
    }
}

impl SnapshotIndex for NonUniqueIdentityIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn extractors(&self) -> &[Extractor] {
        &self.extractors
    }

    fn is_unique(&self) -> bool {
        false
    }

    fn put(&self, snapshot: Arc<Snapshot>) -> Result<()> {
        let key = extract_key(&self.extractors, &snapshot)?;
        self.map.with_mut(&key, |map| {
            let bucket = map.entry(key.clone()).or_default();
            if bucket.iter().any(|s| Arc::ptr_eq(s, &snapshot)) {
                return;
            }
            if bucket.is_empty() {
                self.non_unique_size.fetch_add(1, Ordering::AcqRel);
            }
            bucket.push(snapshot);
            self.unique_size.fetch_add(1, Ordering::AcqRel);
        });
        Ok(())
    }

    fn get(&self, key: &IndexKey) -> Vec<Arc<Snapshot>> {
        self.map.with(key, |bucket| bucket.cloned().unwrap_or_default())
    }

    /// Removes one instance with the same identity and rectangle
    fn remove(&self, snapshot: &Snapshot) -> Result<bool> {
        let key = extract_key(&self.extractors, snapshot)?;
        Ok(self.remove_where(&key, |s| same_version(s, snapshot)))
    }

    fn len(&self) -> usize {
        self.unique_size()
    }

    fn key_count(&self) -> usize {
        self.non_unique_size()
    }

    fn clear(&self) {
        // Counters are reset shard by shard so they stay consistent with
        // what concurrent readers can observe
        for shard in self.map.shards() {
            let mut guard = shard.write();
            let snapshots: usize = guard.values().map(Vec::len).sum();
            self.unique_size.fetch_sub(snapshots, Ordering::AcqRel);
            self.non_unique_size.fetch_sub(guard.len(), Ordering::AcqRel);
            guard.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attribute, AttributeKind, Value};

    fn trade(id: i64, book: &str) -> Arc<Snapshot> {
        Arc::new(
            Snapshot::builder(vec![Value::Int(id)])
                .attribute("id", id)
                .attribute("book", book)
                .build()
                .unwrap(),
        )
    }

    fn index() -> NonUniqueIdentityIndex {
        NonUniqueIdentityIndex::new(
            "by_book",
            vec![Attribute::new("book", AttributeKind::Str).extractor()],
            8,
        )
    }

    #[test]
    fn test_average_bucket_size() {
        let index = index();
        assert_eq!(index.average_bucket_size(), 0);

        for id in 0..3 {
            index.put(trade(id, "A")).unwrap();
        }
        index.put(trade(10, "B")).unwrap();
        assert_eq!(index.unique_size(), 4);
        assert_eq!(index.non_unique_size(), 2);
        assert_eq!(index.average_bucket_size(), 2);

        index.put(trade(11, "C")).unwrap();
        // ceil(5 / 3)
        assert_eq!(index.average_bucket_size(), 2);

        index.remove(&trade(10, "B")).unwrap();
        index.remove(&trade(11, "C")).unwrap();
        assert_eq!(index.non_unique_size(), 1);
        assert_eq!(index.average_bucket_size(), 3);
    }

    #[test]
    fn test_identity_semantics() {
        let index = index();
        let first = trade(1, "A");
        let twin = trade(1, "A");
        index.put(Arc::clone(&first)).unwrap();
        index.put(Arc::clone(&first)).unwrap();
        index.put(Arc::clone(&twin)).unwrap();
        assert_eq!(index.get(&IndexKey::single("A")).len(), 2);

        assert!(index.remove_instance(&twin).unwrap());
        let left = index.get(&IndexKey::single("A"));
        assert_eq!(left.len(), 1);
        assert!(Arc::ptr_eq(&left[0], &first));
    }

    #[test]
    fn test_clear_resets_counters() {
        let index = index();
        for id in 0..10 {
            index.put(trade(id, if id < 5 { "A" } else { "B" })).unwrap();
        }
        index.clear();
        assert_eq!(index.unique_size(), 0);
        assert_eq!(index.non_unique_size(), 0);
        assert!(index.get(&IndexKey::single("A")).is_empty());
    }
}
