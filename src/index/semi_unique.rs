//! Full semi-unique dated index
//!
//! The primary index of a dated cache. Every identity owns a version chain:
//! all of its snapshots, historical and current, in insertion order, plus a
//! version stamped from an index-wide clock on every change so transactions
//! can detect that a chain moved underneath them. The clock never repeats, so
//! a chain dropped and loaded again never comes back with a version a reader
//! saw before.
//!
//! ```text
//!  identity ──▶ VersionChain { version: 7 }
//!                 ├─ [2002-01-01, INF) × [2002-01-02, 2002-01-03)   closed
//!                 ├─ [2002-01-01, INF) × [2002-01-03, INF)          open
//!                 └─ ...
//! ```
//!
//! Bulk loads use [`SemiUniqueDatedIndex::put_semi_unique`], which never
//! rejects; overlapping versions are found afterwards with
//! [`SemiUniqueDatedIndex::collect_milestoning_overlaps`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, instrument};

use super::shard::{Shard, ShardedMap};
use super::{same_version, SnapshotIndex};
use crate::error::{Error, Result};
use crate::model::{Extractor, IndexKey, OverlapPair, Snapshot};
use crate::temporal::{Interval, Timestamp};

/// Snapshot count above which the overlap scan fans out over threads
const PARALLEL_SCAN_THRESHOLD: usize = 16_384;

/// All versions of one identity
#[derive(Debug, Clone, Default)]
pub struct VersionChain {
    versions: Vec<Arc<Snapshot>>,
    version: u64,
}

impl VersionChain {
    pub fn versions(&self) -> &[Arc<Snapshot>] {
        &self.versions
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    fn push(&mut self, snapshot: Arc<Snapshot>, version: u64) {
        self.versions.push(snapshot);
        self.version = version;
    }

    /// Pairs per the scan rule: for each position i, the first later
    /// position j whose rectangle overlaps gives (i, j). The chain is viewed
    /// in canonical rectangle order so the result does not depend on load
    /// order.
    fn overlaps(&self) -> Vec<OverlapPair> {
        if self.versions.len() < 2 {
            return Vec::new();
        }
        let mut ordered: Vec<&Arc<Snapshot>> = self.versions.iter().collect();
        ordered.sort_by(|a, b| a.rectangle().canonical_cmp(b.rectangle()));

        let mut pairs = Vec::new();
        for (i, first) in ordered.iter().enumerate() {
            if let Some(second) = ordered[i + 1..]
                .iter()
                .find(|s| first.rectangle().overlaps(s.rectangle()))
            {
                pairs.push(OverlapPair {
                    original: Arc::clone(first),
                    duplicate: Arc::clone(second),
                });
            }
        }
        pairs
    }
}

/// Primary index holding every version per identity
pub struct SemiUniqueDatedIndex {
    name: String,
    extractors: Vec<Extractor>,
    map: ShardedMap<VersionChain>,
    snapshots: AtomicUsize,
    clock: AtomicU64,
}

impl SemiUniqueDatedIndex {
    pub fn new(name: impl Into<String>, extractors: Vec<Extractor>, shard_count: usize) -> Self {
        Self {
            name: name.into(),
            extractors,
            map: ShardedMap::new(shard_count),
            snapshots: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
        }
    }

    /// Next chain version; strictly increasing across the index
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Append without any overlap check
    pub fn put_semi_unique(&self, snapshot: Arc<Snapshot>) {
        let key = snapshot.identity().clone();
        self.map.with_mut(&key, |map| {
            map.entry(key.clone()).or_default().push(snapshot, self.tick());
        });
        self.snapshots.fetch_add(1, Ordering::AcqRel);
    }

    /// Append unless the rectangle overlaps an existing version
    pub fn put_checked(&self, snapshot: Arc<Snapshot>) -> Result<()> {
        let key = snapshot.identity().clone();
        self.map.with_mut(&key, |map| {
            let chain = map.entry(key.clone()).or_default();
            if let Some(existing) = chain
                .versions
                .iter()
                .find(|s| s.rectangle().overlaps(snapshot.rectangle()))
            {
                return Err(Error::DuplicateKey {
                    index: self.name.clone(),
                    key: key.to_string(),
                    existing: existing.rectangle().to_string(),
                    incoming: snapshot.rectangle().to_string(),
                });
            }
            chain.push(snapshot, self.tick());
            self.snapshots.fetch_add(1, Ordering::AcqRel);
            Ok(())
        })
    }

    /// The unique version containing the point; `AmbiguousResult` when
    /// overlapping versions both match
    pub fn get_as_of(
        &self,
        identity: &IndexKey,
        business: Timestamp,
        processing: Timestamp,
    ) -> Result<Option<Arc<Snapshot>>> {
        let mut matches = self.map.with(identity, |chain| {
            chain
                .map(|c| {
                    c.versions
                        .iter()
                        .filter(|s| s.rectangle().contains(business, processing))
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        });
        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            n => Err(Error::AmbiguousResult {
                identity: identity.to_string(),
                matches: n,
            }),
        }
    }

    /// Versions intersecting a query region
    pub fn get_range(
        &self,
        identity: &IndexKey,
        business: &Interval,
        processing: &Interval,
    ) -> Vec<Arc<Snapshot>> {
        self.map.with(identity, |chain| {
            chain
                .map(|c| {
                    c.versions
                        .iter()
                        .filter(|s| s.rectangle().intersects_range(business, processing))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    /// Copy of an identity's chain with its version; version 0 for an
    /// identity not present
    pub fn chain(&self, identity: &IndexKey) -> (Vec<Arc<Snapshot>>, u64) {
        self.map.with(identity, |chain| {
            chain
                .map(|c| (c.versions.clone(), c.version))
                .unwrap_or_default()
        })
    }

    /// Current version of an identity's chain
    pub fn chain_version(&self, identity: &IndexKey) -> u64 {
        self.map.with(identity, |chain| chain.map_or(0, |c| c.version))
    }

    /// Swap several chains in one step. Every owning shard is write-locked
    /// before the first swap and released after the last, so a reader that
    /// sees any of the new chains sees all of them. Returns the old lists in
    /// input order.
    pub fn replace_chains(
        &self,
        chains: Vec<(IndexKey, Vec<Arc<Snapshot>>)>,
    ) -> Result<Vec<Vec<Arc<Snapshot>>>> {
        let mut held = self.map.write_many(chains.iter().map(|(key, _)| key));
        let version = self.tick();
        let mut added = 0;
        let mut olds = Vec::with_capacity(chains.len());
        for (identity, versions) in chains {
            added += versions.len();
            let map = held.map_for(&identity).ok_or_else(|| {
                Error::Internal(format!("shard of {} not held during chain swap", identity))
            })?;
            let chain = map.entry(identity).or_default();
            olds.push(std::mem::replace(&mut chain.versions, versions));
            chain.version = version;
        }
        drop(held);
        let removed: usize = olds.iter().map(Vec::len).sum();
        self.snapshots.fetch_add(added, Ordering::AcqRel);
        self.snapshots.fetch_sub(removed, Ordering::AcqRel);
        debug!(chains = olds.len(), version, "Swapped chains");
        Ok(olds)
    }

    /// Drop an identity and all its versions
    pub fn remove_identity(&self, identity: &IndexKey) -> Vec<Arc<Snapshot>> {
        let removed = self
            .map
            .with_mut(identity, |map| map.remove(identity))
            .map(|c| c.versions)
            .unwrap_or_default();
        self.snapshots.fetch_sub(removed.len(), Ordering::AcqRel);
        removed
    }

    /// Every identity currently present
    pub fn identities(&self) -> Vec<IndexKey> {
        self.map.collect(|key, _, out| out.push(key.clone()))
    }

    /// Every snapshot, one shard at a time
    pub fn all(&self) -> Vec<Arc<Snapshot>> {
        self.map
            .collect(|_, chain: &VersionChain, out| out.extend(chain.versions.iter().cloned()))
    }

    /// Physically remove closed versions whose processing `to` is at or
    /// before `before`; returns them
    pub fn purge_closed_before(&self, before: Timestamp) -> Vec<Arc<Snapshot>> {
        let mut purged = Vec::new();
        for shard in self.map.shards() {
            let mut guard = shard.write();
            guard.retain(|_, chain| {
                let keep: Vec<_> = chain
                    .versions
                    .iter()
                    .filter(|s| s.is_open() || s.processing().to() > before)
                    .cloned()
                    .collect();
                if keep.len() != chain.versions.len() {
                    purged.extend(
                        chain
                            .versions
                            .iter()
                            .filter(|s| !s.is_open() && s.processing().to() <= before)
                            .cloned(),
                    );
                    chain.versions = keep;
                    chain.version = self.tick();
                }
                !chain.versions.is_empty()
            });
        }
        self.snapshots.fetch_sub(purged.len(), Ordering::AcqRel);
        purged
    }

    pub fn identity_count(&self) -> usize {
        self.map.len()
    }

    // =========================================================================
    // Overlap Scan
    // =========================================================================

    /// All overlapping version pairs, grouped by identity and ordered by
    /// identity. Work is proportional to versions per identity.
    #[instrument(skip(self), fields(index = %self.name))]
    pub fn overlap_pairs(&self) -> Result<Vec<OverlapPair>> {
        let mut pairs = if self.len() >= PARALLEL_SCAN_THRESHOLD {
            self.scan_parallel()?
        } else {
            self.map.shards().flat_map(scan_shard).collect()
        };
        pairs.sort_by(|a, b| a.identity().cmp(b.identity()));
        debug!(pairs = pairs.len(), "Overlap scan complete");
        Ok(pairs)
    }

    /// Flat list `[original, duplicate, original, duplicate, ...]`
    pub fn collect_milestoning_overlaps(&self) -> Result<Vec<Arc<Snapshot>>> {
        Ok(self
            .overlap_pairs()?
            .into_iter()
            .flat_map(|p| [p.original, p.duplicate])
            .collect())
    }

    fn scan_parallel(&self) -> Result<Vec<OverlapPair>> {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(self.map.shard_count());
        let shards: Vec<&Shard<VersionChain>> = self.map.shards().collect();
        let chunk = shards.len().div_ceil(threads);

        crossbeam::thread::scope(|scope| {
            let handles: Vec<_> = shards
                .chunks(chunk)
                .map(|group| {
                    scope.spawn(move |_| {
                        group.iter().flat_map(|s| scan_shard(s)).collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join())
                .collect::<std::result::Result<Vec<_>, _>>()
        })
        .and_then(|r| r)
        .map(|groups| groups.into_iter().flatten().collect())
        .map_err(|_| Error::Internal("overlap scan worker panicked".into()))
    }
}

fn scan_shard(shard: &Shard<VersionChain>) -> Vec<OverlapPair> {
    shard.read().values().flat_map(VersionChain::overlaps).collect()
}

impl SnapshotIndex for SemiUniqueDatedIndex {
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
        self.put_checked(snapshot)
    }

    fn get(&self, key: &IndexKey) -> Vec<Arc<Snapshot>> {
        self.chain(key).0
    }

    fn remove(&self, snapshot: &Snapshot) -> Result<bool> {
        let identity = snapshot.identity();
        let removed = self.map.with_mut(identity, |map| {
            let Some(chain) = map.get_mut(identity) else {
                return false;
            };
            let Some(position) = chain.versions.iter().position(|s| same_version(s, snapshot))
            else {
                return false;
            };
            chain.versions.remove(position);
            chain.version = self.tick();
            if chain.versions.is_empty() {
                map.remove(identity);
            }
            true
        });
        if removed {
            self.snapshots.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(removed)
    }

    fn len(&self) -> usize {
        self.snapshots.load(Ordering::Acquire)
    }

    fn key_count(&self) -> usize {
        self.identity_count()
    }

    fn clear(&self) {
        for shard in self.map.shards() {
            let mut guard = shard.write();
            let count: usize = guard.values().map(|c| c.versions.len()).sum();
            guard.clear();
            self.snapshots.fetch_sub(count, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Value;
    use crate::temporal::Rectangle;
    use assert_matches::assert_matches;

    fn ts(text: &str) -> Timestamp {
        Timestamp::parse(text).unwrap()
    }

    fn snap(id: i64, business: (&str, &str), processing: (&str, &str)) -> Arc<Snapshot> {
        Arc::new(
            Snapshot::builder(vec![Value::Int(id)])
                .attribute("id", id)
                .rectangle(Rectangle::new(
                    Interval::parse(business.0, business.1).unwrap(),
                    Interval::parse(processing.0, processing.1).unwrap(),
                ))
                .build()
                .unwrap(),
        )
    }

    fn index() -> SemiUniqueDatedIndex {
        SemiUniqueDatedIndex::new("primary", Vec::new(), 8)
    }

    #[test]
    fn test_as_of_lookup() {
        let index = index();
        index.put_semi_unique(snap(1, ("2002-01-01", "infinity"), ("2002-01-02", "2002-01-03")));
        index.put_semi_unique(snap(1, ("2002-01-01", "infinity"), ("2002-01-03", "infinity")));

        let id = IndexKey::single(1);
        let current = index.get_as_of(&id, ts("2005-01-01"), Timestamp::INFINITY).unwrap().unwrap();
        assert!(current.is_open());

        let past = index
            .get_as_of(&id, ts("2005-01-01"), ts("2002-01-02 06:00:00"))
            .unwrap()
            .unwrap();
        assert_eq!(past.processing().to(), ts("2002-01-03"));

        assert!(index.get_as_of(&id, ts("2001-01-01"), Timestamp::INFINITY).unwrap().is_none());
        assert_eq!(index.len(), 2);
        assert_eq!(index.identity_count(), 1);
    }

    #[test]
    fn test_ambiguous_result() {
        let index = index();
        index.put_semi_unique(snap(1, ("2002-01-01", "infinity"), ("2002-01-03", "infinity")));
        index.put_semi_unique(snap(1, ("2002-01-01", "infinity"), ("2002-01-04", "infinity")));
        assert_matches!(
            index.get_as_of(&IndexKey::single(1), ts("2003-01-01"), Timestamp::INFINITY),
            Err(Error::AmbiguousResult { matches: 2, .. })
        );
    }

    #[test]
    fn test_put_checked_rejects_overlap() {
        let index = index();
        index
            .put_checked(snap(1, ("2002-01-01", "infinity"), ("2002-01-02", "2002-01-03")))
            .unwrap();
        index
            .put_checked(snap(1, ("2002-01-01", "infinity"), ("2002-01-03", "infinity")))
            .unwrap();
        assert_matches!(
            index.put_checked(snap(1, ("2002-06-01", "infinity"), ("2002-01-05", "infinity"))),
            Err(Error::DuplicateKey { .. })
        );
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_overlap_pairs_rule() {
        let index = index();
        // Three mutually overlapping open versions give two pairs
        for day in ["2002-01-03", "2002-01-04", "2002-01-05"] {
            index.put_semi_unique(snap(1, ("2002-01-01", "infinity"), (day, "infinity")));
        }
        index.put_semi_unique(snap(2, ("2002-01-01", "infinity"), ("2002-01-03", "infinity")));

        let pairs = index.overlap_pairs().unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].original.processing().from(), ts("2002-01-03"));
        assert_eq!(pairs[0].duplicate.processing().from(), ts("2002-01-04"));
        assert_eq!(pairs[1].original.processing().from(), ts("2002-01-04"));
        assert_eq!(pairs[1].duplicate.processing().from(), ts("2002-01-05"));

        let flat = index.collect_milestoning_overlaps().unwrap();
        assert_eq!(flat.len(), 4);
    }

    #[test]
    fn test_parallel_scan_matches_serial() {
        let index = SemiUniqueDatedIndex::new("primary", Vec::new(), 64);
        for id in 0..(PARALLEL_SCAN_THRESHOLD as i64 / 2 + 10) {
            index.put_semi_unique(snap(id, ("2002-01-01", "infinity"), ("2002-01-02", "2002-01-03")));
            index.put_semi_unique(snap(id, ("2002-01-01", "infinity"), ("2002-01-03", "infinity")));
        }
        index.put_semi_unique(snap(7, ("2002-01-01", "infinity"), ("2002-01-04", "infinity")));
        assert!(index.len() >= PARALLEL_SCAN_THRESHOLD);

        let pairs = index.overlap_pairs().unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].identity(), &IndexKey::single(7));
    }

    #[test]
    fn test_replace_chain_and_remove() {
        let index = index();
        let id = IndexKey::single(1);
        let open = snap(1, ("2002-01-01", "infinity"), ("2002-01-02", "infinity"));
        index.put_semi_unique(Arc::clone(&open));
        let (_, v1) = index.chain(&id);

        let closed = Arc::new(open.closed_at(ts("2002-02-01")));
        let old = index
            .replace_chains(vec![(id.clone(), vec![Arc::clone(&closed)])])
            .unwrap();
        assert_eq!(old[0].len(), 1);
        assert!(index.chain_version(&id) > v1);
        assert_eq!(index.len(), 1);

        assert!(index.remove(&closed).unwrap());
        assert_eq!(index.len(), 0);
        assert_eq!(index.identity_count(), 0);
    }

    #[test]
    fn test_version_not_reused_after_remove_and_reload() {
        let index = index();
        let id = IndexKey::single(1);
        index.put_semi_unique(snap(1, ("2002-01-01", "infinity"), ("2002-01-02", "infinity")));
        let seen = index.chain_version(&id);

        assert_eq!(index.remove_identity(&id).len(), 1);
        assert_eq!(index.chain_version(&id), 0);

        index.put_semi_unique(snap(1, ("2002-01-01", "infinity"), ("2002-01-02", "infinity")));
        assert!(index.chain_version(&id) > seen);

        index.clear();
        index.put_semi_unique(snap(1, ("2002-01-01", "infinity"), ("2002-01-02", "infinity")));
        assert!(index.chain_version(&id) > seen + 1);
    }

    #[test]
    fn test_replace_chains_swaps_together() {
        let index = index();
        let first = IndexKey::single(1);
        let second = IndexKey::single(2);
        index.put_semi_unique(snap(1, ("2002-01-01", "infinity"), ("2002-01-02", "infinity")));

        let olds = index
            .replace_chains(vec![
                (
                    first.clone(),
                    vec![snap(1, ("2002-01-01", "infinity"), ("2002-01-03", "infinity"))],
                ),
                (
                    second.clone(),
                    vec![snap(2, ("2002-01-01", "infinity"), ("2002-01-03", "infinity"))],
                ),
            ])
            .unwrap();
        assert_eq!(olds.len(), 2);
        assert_eq!(olds[0].len(), 1);
        assert!(olds[1].is_empty());
        assert_eq!(index.len(), 2);
        assert_eq!(index.identity_count(), 2);
        assert_eq!(index.chain_version(&first), index.chain_version(&second));
    }

    #[test]
    fn test_purge_closed_before() {
        let index = index();
        index.put_semi_unique(snap(1, ("2002-01-01", "infinity"), ("2002-01-02", "2002-01-03")));
        index.put_semi_unique(snap(1, ("2002-01-01", "infinity"), ("2002-01-03", "infinity")));
        index.put_semi_unique(snap(2, ("2002-01-01", "infinity"), ("2002-01-02", "2002-03-01")));

        let purged = index.purge_closed_before(ts("2002-02-01"));
        assert_eq!(purged.len(), 1);
        assert_eq!(index.len(), 2);
        assert_eq!(index.identity_count(), 2);
    }
}
