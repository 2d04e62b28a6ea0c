//! Non-unique index with value semantics
//!
//! A bucket holds at most one snapshot per (identity, rectangle); putting an
//! equal version again replaces it. Used for secondary indices of non-dated
//! entities.

use std::sync::Arc;

use super::shard::ShardedMap;
use super::{same_version, SnapshotIndex};
use crate::error::Result;
use crate::model::{extract_key, Extractor, IndexKey, Snapshot};

pub struct NonUniqueIndex {
    name: String,
    extractors: Vec<Extractor>,
    map: ShardedMap<Vec<Arc<Snapshot>>>,
}

impl NonUniqueIndex {
    pub fn new(name: impl Into<String>, extractors: Vec<Extractor>, shard_count: usize) -> Self {
        Self {
            name: name.into(),
            extractors,
            map: ShardedMap::new(shard_count),
        }
    }
}

impl SnapshotIndex for NonUniqueIndex {
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
            match bucket.iter_mut().find(|s| same_version(s, &snapshot)) {
                Some(slot) => *slot = snapshot,
                None => bucket.push(snapshot),
            }
        });
        Ok(())
    }

    fn get(&self, key: &IndexKey) -> Vec<Arc<Snapshot>> {
        self.map.with(key, |bucket| bucket.cloned().unwrap_or_default())
    }

    fn remove(&self, snapshot: &Snapshot) -> Result<bool> {
        let key = extract_key(&self.extractors, snapshot)?;
        Ok(self.map.with_mut(&key, |map| {
            let Some(bucket) = map.get_mut(&key) else {
                return false;
            };
            let before = bucket.len();
            bucket.retain(|s| !same_version(s, snapshot));
            let removed = bucket.len() != before;
            if bucket.is_empty() {
                map.remove(&key);
            }
            removed
        }))
    }

    fn len(&self) -> usize {
        self.map
            .collect(|_, bucket: &Vec<Arc<Snapshot>>, out: &mut Vec<usize>| out.push(bucket.len()))
            .into_iter()
            .sum()
    }

    fn key_count(&self) -> usize {
        self.map.len()
    }

    fn clear(&self) {
        self.map.clear();
    }
}
