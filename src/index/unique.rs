//! Full unique index: exactly one snapshot per key, non-dated entities only

use std::sync::Arc;

use super::shard::ShardedMap;
use super::{same_version, SnapshotIndex};
use crate::error::{Error, Result};
use crate::model::{extract_key, Extractor, IndexKey, Snapshot};

/// Unique index over one or more attributes
pub struct UniqueIndex {
    name: String,
    extractors: Vec<Extractor>,
    map: ShardedMap<Arc<Snapshot>>,
}

impl UniqueIndex {
    pub fn new(name: impl Into<String>, extractors: Vec<Extractor>, shard_count: usize) -> Self {
        Self {
            name: name.into(),
            extractors,
            map: ShardedMap::new(shard_count),
        }
    }

    /// The single snapshot under `key`
    pub fn get_one(&self, key: &IndexKey) -> Option<Arc<Snapshot>> {
        self.map.with(key, |slot| slot.cloned())
    }
}

impl SnapshotIndex for UniqueIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn extractors(&self) -> &[Extractor] {
        &self.extractors
    }

    fn is_unique(&self) -> bool {
        true
    }

    fn put(&self, snapshot: Arc<Snapshot>) -> Result<()> {
        let key = extract_key(&self.extractors, &snapshot)?;
        self.map.with_mut(&key, |map| {
            if let Some(existing) = map.get(&key) {
                if !Arc::ptr_eq(existing, &snapshot)
                    && existing.rectangle().overlaps(snapshot.rectangle())
                {
                    return Err(Error::DuplicateKey {
                        index: self.name.clone(),
                        key: key.to_string(),
                        existing: existing.to_string(),
                        incoming: snapshot.to_string(),
                    });
                }
            }
            map.insert(key.clone(), snapshot);
            Ok(())
        })
    }

    fn get(&self, key: &IndexKey) -> Vec<Arc<Snapshot>> {
        self.get_one(key).into_iter().collect()
    }

    fn remove(&self, snapshot: &Snapshot) -> Result<bool> {
        let key = extract_key(&self.extractors, snapshot)?;
        Ok(self.map.with_mut(&key, |map| {
            let matches = map.get(&key).is_some_and(|s| same_version(s, snapshot));
            if matches {
                map.remove(&key);
            }
            matches
        }))
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn key_count(&self) -> usize {
        self.map.len()
    }

    fn clear(&self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attribute, AttributeKind, Value};
    use assert_matches::assert_matches;

    fn currency(code: &str, name: &str) -> Arc<Snapshot> {
        Arc::new(
            Snapshot::builder(vec![Value::from(code)])
                .attribute("code", code)
                .attribute("name", name)
                .build()
                .unwrap(),
        )
    }

    fn index() -> UniqueIndex {
        UniqueIndex::new(
            "by_name",
            vec![Attribute::new("name", AttributeKind::Str).extractor()],
            4,
        )
    }

    #[test]
    fn test_put_get_remove() {
        let index = index();
        let usd = currency("USD", "dollar");
        index.put(Arc::clone(&usd)).unwrap();
        // Re-putting the same instance is a no-op
        index.put(Arc::clone(&usd)).unwrap();
        assert_eq!(index.len(), 1);

        let found = index.get(&IndexKey::single("dollar"));
        assert_eq!(found.len(), 1);
        assert!(Arc::ptr_eq(&found[0], &usd));

        assert!(index.remove(&usd).unwrap());
        assert!(index.get(&IndexKey::single("dollar")).is_empty());
        assert!(!index.remove(&usd).unwrap());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let index = index();
        index.put(currency("USD", "dollar")).unwrap();
        assert_matches!(
            index.put(currency("CAD", "dollar")),
            Err(Error::DuplicateKey { .. })
        );
        assert_eq!(index.len(), 1);
    }
}
