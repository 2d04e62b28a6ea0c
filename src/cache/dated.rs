//! Dated cache engine
//!
//! ```text
//!                 ┌───────────────────────────────────────────┐
//!  find ─────────▶│  primary: SemiUniqueDatedIndex (slot 1)   │
//!  find_range     │  secondaries: Unique / NonUnique (2..)    │
//!  find_by_index ▶│  strings: StringIndex                     │
//!                 │  relationships: edge table                │
//!  update ──lock─▶│  mutation::apply ─▶ publish chain         │
//!                 └───────────────────────────────────────────┘
//! ```
//!
//! Each identity's versions live in one chain inside the primary index. A
//! write computes the complete new chains off to the side and swaps them in
//! while holding every owning shard's write lock, then brings the secondary
//! indices in line, so a reader of the primary index sees all of the old
//! chains or all of the new ones.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::config::{CacheConfig, CacheMode};
use super::locks::{KeyLockTable, StripeGuards};
use super::metrics::CacheMetrics;
use super::mutation::{apply, Changes, Mutation};
use super::relationship::RelationshipTable;
use super::source::DataSource;
use crate::error::{Error, Result};
use crate::index::{
    next_cache_id, IndexReference, NonUniqueIdentityIndex, NonUniqueIndex, SemiUniqueDatedIndex,
    SnapshotIndex, StringIndex, UniqueIndex, PRIMARY_SLOT,
};
use crate::model::{
    extract_key, EntityDescriptor, IndexKey, IndexKind, OverlapPair, Snapshot, PRIMARY_INDEX,
};
use crate::temporal::{Interval, Timestamp};

/// In-memory cache of every version of one entity type
pub struct DatedCache {
    id: u64,
    descriptor: Arc<EntityDescriptor>,
    config: CacheConfig,
    primary: SemiUniqueDatedIndex,
    secondaries: Vec<Box<dyn SnapshotIndex>>,
    strings: StringIndex,
    locks: KeyLockTable,
    relationships: RelationshipTable,
    metrics: CacheMetrics,
}

impl DatedCache {
    /// Create an empty cache
    pub fn new(descriptor: EntityDescriptor, config: CacheConfig) -> Result<Self> {
        descriptor.validate()?;
        config.validate()?;
        for name in &config.interned_attributes {
            match descriptor.find_attribute(name) {
                Some(a) if a.kind == crate::model::AttributeKind::Str => {}
                _ => {
                    return Err(Error::Config(format!(
                        "interned attribute '{}' is not a string attribute of {}",
                        name, descriptor.name
                    )))
                }
            }
        }

        let shards = config.shard_count;
        let primary = SemiUniqueDatedIndex::new(
            PRIMARY_INDEX,
            descriptor.identity_extractors()?,
            shards,
        );
        let mut secondaries: Vec<Box<dyn SnapshotIndex>> = Vec::new();
        for spec in &descriptor.indices {
            let extractors = descriptor.extractors_for(&spec.attributes)?;
            let index: Box<dyn SnapshotIndex> = match spec.kind {
                IndexKind::Unique => Box::new(UniqueIndex::new(&spec.name, extractors, shards)),
                IndexKind::NonUnique if descriptor.is_dated() => Box::new(
                    NonUniqueIdentityIndex::new(&spec.name, extractors, shards),
                ),
                IndexKind::NonUnique => {
                    Box::new(NonUniqueIndex::new(&spec.name, extractors, shards))
                }
            };
            secondaries.push(index);
        }

        let id = next_cache_id();
        info!(
            cache_id = id,
            entity = %descriptor.name,
            mode = %config.mode,
            secondaries = secondaries.len(),
            "Created dated cache"
        );

        Ok(Self {
            id,
            metrics: CacheMetrics::new(&descriptor.name)?,
            descriptor: Arc::new(descriptor),
            strings: StringIndex::new(config.shard_count.min(64)),
            locks: KeyLockTable::new(config.lock_stripes),
            relationships: RelationshipTable::new(),
            config,
            primary,
            secondaries,
        })
    }

    /// Instance id; index references are bound to it
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn descriptor(&self) -> &Arc<EntityDescriptor> {
        &self.descriptor
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn string_index(&self) -> &StringIndex {
        &self.strings
    }

    /// Number of snapshots
    pub fn len(&self) -> usize {
        self.primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct identities
    pub fn identity_count(&self) -> usize {
        self.primary.identity_count()
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Insert without any overlap check; duplicates surface in
    /// [`DatedCache::collect_milestoning_overlaps`]
    pub fn put_dated_data(&self, snapshot: Snapshot) -> Result<Arc<Snapshot>> {
        let snapshot = self.prepare(snapshot)?;
        self.index_secondaries(&snapshot)?;
        self.primary.put_semi_unique(Arc::clone(&snapshot));
        self.metrics.record_puts(1);
        self.refresh_sizes();
        Ok(snapshot)
    }

    /// Bulk load every row of a source
    #[instrument(skip(self, source), fields(entity = %self.descriptor.name))]
    pub fn load_full(&self, source: &dyn DataSource) -> Result<usize> {
        let rows = source.fetch_all()?;
        let mut loaded = 0;
        for row in &rows {
            self.put_dated_data(source.create_object_from(row)?)?;
            loaded += 1;
        }
        info!(
            rows = loaded,
            identities = self.identity_count(),
            "Full cache load complete"
        );
        Ok(loaded)
    }

    /// Point lookup that falls back to the data source on a miss when the
    /// cache is partial
    pub fn find_or_load(
        &self,
        identity: &IndexKey,
        business: Option<Timestamp>,
        processing: Option<Timestamp>,
        source: &dyn DataSource,
    ) -> Result<Option<Arc<Snapshot>>> {
        if self.config.mode == CacheMode::Full || self.primary.chain_version(identity) > 0 {
            return self.find(identity, business, processing);
        }

        {
            let _guard = self.locks.lock(identity, self.config.lock_timeout())?;
            // Another loader may have won the race for the stripe
            if self.primary.get(identity).is_empty() {
                let rows = source.fetch(identity)?;
                debug!(identity = %identity, rows = rows.len(), "Loading identity on miss");
                for row in &rows {
                    self.put_dated_data(source.create_object_from(row)?)?;
                }
            }
        }
        self.find(identity, business, processing)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// The snapshot effective at the given point. Business defaults to now,
    /// processing to the latest state.
    pub fn find(
        &self,
        identity: &IndexKey,
        business: Option<Timestamp>,
        processing: Option<Timestamp>,
    ) -> Result<Option<Arc<Snapshot>>> {
        let business = business.unwrap_or_else(Timestamp::now);
        let processing = processing.unwrap_or(Timestamp::INFINITY);
        let found = self.primary.get_as_of(identity, business, processing)?;
        if found.is_some() {
            self.metrics.record_hit();
        } else {
            self.metrics.record_miss();
        }
        Ok(found)
    }

    /// Every version of an identity intersecting the given region
    pub fn find_range(
        &self,
        identity: &IndexKey,
        business: &Interval,
        processing: &Interval,
    ) -> Vec<Arc<Snapshot>> {
        self.primary.get_range(identity, business, processing)
    }

    /// Full version history of an identity
    pub fn history(&self, identity: &IndexKey) -> Vec<Arc<Snapshot>> {
        self.primary.get(identity)
    }

    /// Every snapshot in the cache
    pub fn scan_all(&self) -> Vec<Arc<Snapshot>> {
        self.primary.all()
    }

    /// Reference to a named index of this cache
    pub fn index_ref(&self, name: &str) -> Result<IndexReference> {
        if name == PRIMARY_INDEX {
            return Ok(IndexReference::new(self.id, PRIMARY_SLOT));
        }
        self.secondaries
            .iter()
            .position(|i| i.name() == name)
            .map(|p| IndexReference::new(self.id, PRIMARY_SLOT + 1 + p as i32))
            .ok_or_else(|| {
                Error::Config(format!(
                    "{} has no index named '{}'",
                    self.descriptor.name, name
                ))
            })
    }

    /// Reference to the index keyed on exactly these attributes, preferring
    /// the primary index
    pub fn best_index_reference(&self, attributes: &[&str]) -> Option<IndexReference> {
        let wanted: HashSet<&str> = attributes.iter().copied().collect();
        let matches = |index: &dyn SnapshotIndex| {
            let names: HashSet<&str> = index.extractors().iter().map(|e| e.attribute()).collect();
            names == wanted
        };
        if matches(&self.primary as &dyn SnapshotIndex) {
            return Some(IndexReference::new(self.id, PRIMARY_SLOT));
        }
        self.secondaries
            .iter()
            .position(|i| matches(i.as_ref()))
            .map(|p| IndexReference::new(self.id, PRIMARY_SLOT + 1 + p as i32))
    }

    /// All snapshots under `key` in the referenced index
    pub fn find_by_index(
        &self,
        reference: IndexReference,
        key: &IndexKey,
    ) -> Result<Vec<Arc<Snapshot>>> {
        Ok(self.resolve(reference)?.get(key))
    }

    /// Snapshots under `key` effective at the given point
    pub fn find_by_index_as_of(
        &self,
        reference: IndexReference,
        key: &IndexKey,
        business: Option<Timestamp>,
        processing: Option<Timestamp>,
    ) -> Result<Vec<Arc<Snapshot>>> {
        let business = business.unwrap_or_else(Timestamp::now);
        let processing = processing.unwrap_or(Timestamp::INFINITY);
        Ok(self
            .find_by_index(reference, key)?
            .into_iter()
            .filter(|s| s.rectangle().contains(business, processing))
            .collect())
    }

    fn resolve(&self, reference: IndexReference) -> Result<&dyn SnapshotIndex> {
        let position = reference.position_in(self.id, 1 + self.secondaries.len())?;
        Ok(match position {
            0 => &self.primary as &dyn SnapshotIndex,
            n => self.secondaries[n - 1].as_ref(),
        })
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Insert a snapshot, rejecting overlaps with `DuplicateKey`
    pub fn insert(&self, snapshot: Snapshot) -> Result<()> {
        self.apply_mutation(&Mutation::Insert(snapshot))
    }

    /// Milestone the open version at `at` and open a new one from there
    pub fn update(&self, identity: &IndexKey, at: Timestamp, changes: Changes) -> Result<()> {
        self.apply_mutation(&Mutation::Update {
            identity: identity.clone(),
            at,
            business_as_of: None,
            changes,
        })
    }

    /// Like [`DatedCache::update`] for the version effective at a business date
    pub fn update_as_of(
        &self,
        identity: &IndexKey,
        at: Timestamp,
        business_as_of: Timestamp,
        changes: Changes,
    ) -> Result<()> {
        self.apply_mutation(&Mutation::Update {
            identity: identity.clone(),
            at,
            business_as_of: Some(business_as_of),
            changes,
        })
    }

    /// Change the payload over a business range only
    pub fn update_until(
        &self,
        identity: &IndexKey,
        at: Timestamp,
        business: Interval,
        changes: Changes,
    ) -> Result<()> {
        self.apply_mutation(&Mutation::UpdateUntil {
            identity: identity.clone(),
            at,
            business,
            changes,
        })
    }

    /// Close the open versions of an identity
    pub fn terminate(&self, identity: &IndexKey, at: Timestamp) -> Result<()> {
        self.apply_mutation(&Mutation::Terminate {
            identity: identity.clone(),
            at,
        })
    }

    /// Apply one mutation under the identity's stripe lock
    pub fn apply_mutation(&self, mutation: &Mutation) -> Result<()> {
        let identity = mutation.identity();
        let _guard = self.locks.lock(identity, self.config.lock_timeout())?;
        let (chain, _) = self.primary.chain(identity);
        let next = apply(&chain, mutation, &self.descriptor)?;
        self.publish(identity, next)?;
        debug!(mutation = %mutation, "Applied mutation");
        Ok(())
    }

    /// Drop an identity; returns how many snapshots went with it
    pub fn invalidate(&self, identity: &IndexKey) -> Result<usize> {
        let _guard = self.locks.lock(identity, self.config.lock_timeout())?;
        let removed = self.primary.remove_identity(identity);
        for snapshot in &removed {
            self.unindex_secondaries(snapshot)?;
        }
        self.relationships.remove_from(identity);
        self.metrics.record_invalidations(1);
        self.metrics.record_removes(removed.len());
        self.refresh_sizes();
        debug!(identity = %identity, snapshots = removed.len(), "Invalidated identity");
        Ok(removed.len())
    }

    /// Drop everything
    pub fn invalidate_all(&self) {
        let identities = self.primary.identity_count();
        let snapshots = self.primary.len();
        self.primary.clear();
        for index in &self.secondaries {
            index.clear();
        }
        self.relationships.clear();
        self.metrics.record_invalidations(identities);
        self.metrics.record_removes(snapshots);
        self.refresh_sizes();
        info!(
            entity = %self.descriptor.name,
            identities,
            snapshots,
            "Invalidated cache"
        );
    }

    /// Physically remove versions closed at or before `before`
    pub fn purge_closed_before(&self, before: Timestamp) -> Result<usize> {
        let purged = self.primary.purge_closed_before(before);
        for snapshot in &purged {
            self.unindex_secondaries(snapshot)?;
        }
        self.metrics.record_removes(purged.len());
        self.refresh_sizes();
        Ok(purged.len())
    }

    // =========================================================================
    // Overlap Detection
    // =========================================================================

    /// Overlapping version pairs per identity
    pub fn overlap_pairs(&self) -> Result<Vec<OverlapPair>> {
        let pairs = self.primary.overlap_pairs()?;
        if !pairs.is_empty() {
            warn!(
                entity = %self.descriptor.name,
                pairs = pairs.len(),
                "Milestoning overlaps detected"
            );
        }
        self.metrics.record_overlaps(pairs.len());
        Ok(pairs)
    }

    /// Flat overlap report: `[original, duplicate, ...]`
    pub fn collect_milestoning_overlaps(&self) -> Result<Vec<Arc<Snapshot>>> {
        Ok(self
            .overlap_pairs()?
            .into_iter()
            .flat_map(|p| [p.original, p.duplicate])
            .collect())
    }

    // =========================================================================
    // Relationships
    // =========================================================================

    /// Record that `from` relates to `to` under `relation`
    pub fn relate(&self, from: &IndexKey, relation: &str, to: IndexKey) {
        self.relationships.relate(from, relation, to);
    }

    pub fn unrelate(&self, from: &IndexKey, relation: &str, to: &IndexKey) -> bool {
        self.relationships.unrelate(from, relation, to)
    }

    /// Related snapshots resolved at the given point; targets with no
    /// effective version are skipped
    pub fn related(
        &self,
        from: &IndexKey,
        relation: &str,
        business: Option<Timestamp>,
        processing: Option<Timestamp>,
    ) -> Result<Vec<Arc<Snapshot>>> {
        let mut resolved = Vec::new();
        for target in self.relationships.targets(from, relation) {
            if let Some(snapshot) = self.find(&target, business, processing)? {
                resolved.push(snapshot);
            }
        }
        Ok(resolved)
    }

    // =========================================================================
    // Transaction Support
    // =========================================================================

    pub(crate) fn lock_identities<'a>(
        &self,
        identities: impl IntoIterator<Item = &'a IndexKey>,
        timeout: std::time::Duration,
    ) -> Result<StripeGuards<'_>> {
        self.locks.lock_all(identities, timeout)
    }

    /// Committed chain of an identity with its version
    pub(crate) fn chain(&self, identity: &IndexKey) -> (Vec<Arc<Snapshot>>, u64) {
        self.primary.chain(identity)
    }

    pub(crate) fn chain_version(&self, identity: &IndexKey) -> u64 {
        self.primary.chain_version(identity)
    }

    /// Swap in a new chain and bring the secondaries in line. The caller
    /// holds the identity's stripe lock.
    pub(crate) fn publish(&self, identity: &IndexKey, next: Vec<Arc<Snapshot>>) -> Result<()> {
        self.publish_all(vec![(identity.clone(), next)])
    }

    /// Swap in new chains for several identities as one step, then bring the
    /// secondaries in line. Nothing is swapped unless every chain passes
    /// validation. The caller holds every identity's stripe lock.
    pub(crate) fn publish_all(&self, chains: Vec<(IndexKey, Vec<Arc<Snapshot>>)>) -> Result<()> {
        let mut swaps = Vec::with_capacity(chains.len());
        let mut added = Vec::new();
        let mut removed = Vec::new();
        for (identity, next) in chains {
            let (old, _) = self.primary.chain(&identity);
            let mut chain = Vec::with_capacity(next.len());
            for snapshot in next {
                if contains_instance(&old, &snapshot) {
                    chain.push(snapshot);
                } else {
                    let prepared = self.prepare((*snapshot).clone())?;
                    added.push(Arc::clone(&prepared));
                    chain.push(prepared);
                }
            }
            removed.extend(old.iter().filter(|s| !contains_instance(&chain, s)).cloned());
            swaps.push((identity, chain));
        }

        self.check_unique_secondaries(&added, &removed)?;
        self.primary.replace_chains(swaps)?;
        for snapshot in &removed {
            self.unindex_secondaries(snapshot)?;
        }
        for snapshot in &added {
            self.index_secondaries(snapshot)?;
        }
        self.metrics.record_puts(added.len());
        self.metrics.record_removes(removed.len());
        self.refresh_sizes();
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Validate and intern a snapshot on its way in
    fn prepare(&self, mut snapshot: Snapshot) -> Result<Arc<Snapshot>> {
        if snapshot.identity() != &extract_key(self.primary.extractors(), &snapshot)? {
            return Err(Error::AttributeMismatch {
                identity: snapshot.identity().to_string(),
                attribute: self.descriptor.primary_key.join(","),
            });
        }
        snapshot.rectangle().validate(snapshot.identity())?;

        if !self.config.interned_attributes.is_empty() {
            let mut failure = None;
            snapshot.map_strings(|name, value| {
                if !self.config.interned_attributes.iter().any(|a| a == name) {
                    return Arc::clone(value);
                }
                match self.strings.intern(value) {
                    Ok(canonical) => canonical,
                    Err(e) => {
                        failure = Some(e);
                        Arc::clone(value)
                    }
                }
            });
            if let Some(e) = failure {
                return Err(e);
            }
        }
        Ok(Arc::new(snapshot))
    }

    fn index_secondaries(&self, snapshot: &Arc<Snapshot>) -> Result<()> {
        for (position, index) in self.secondaries.iter().enumerate() {
            if let Err(e) = index.put(Arc::clone(snapshot)) {
                for earlier in &self.secondaries[..position] {
                    earlier.remove(snapshot)?;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn unindex_secondaries(&self, snapshot: &Snapshot) -> Result<()> {
        for index in &self.secondaries {
            index.remove(snapshot)?;
        }
        Ok(())
    }

    /// Reject a chain swap that would collide in a unique secondary
    fn check_unique_secondaries(
        &self,
        added: &[Arc<Snapshot>],
        removed: &[Arc<Snapshot>],
    ) -> Result<()> {
        for index in self.secondaries.iter().filter(|i| i.is_unique()) {
            let mut incoming: Vec<(IndexKey, &Arc<Snapshot>)> = Vec::with_capacity(added.len());
            for snapshot in added {
                let key = extract_key(index.extractors(), snapshot)?;
                if let Some((_, earlier)) = incoming
                    .iter()
                    .find(|(k, s)| *k == key && s.rectangle().overlaps(snapshot.rectangle()))
                {
                    return Err(Error::DuplicateKey {
                        index: index.name().to_string(),
                        key: key.to_string(),
                        existing: earlier.to_string(),
                        incoming: snapshot.to_string(),
                    });
                }
                for existing in index.get(&key) {
                    let leaving = removed.iter().any(|r| Arc::ptr_eq(r, &existing));
                    if !leaving && existing.rectangle().overlaps(snapshot.rectangle()) {
                        return Err(Error::DuplicateKey {
                            index: index.name().to_string(),
                            key: key.to_string(),
                            existing: existing.to_string(),
                            incoming: snapshot.to_string(),
                        });
                    }
                }
                incoming.push((key, snapshot));
            }
        }
        Ok(())
    }

    fn refresh_sizes(&self) {
        self.metrics
            .update_sizes(self.primary.len(), self.primary.identity_count());
    }
}

fn contains_instance(list: &[Arc<Snapshot>], snapshot: &Arc<Snapshot>) -> bool {
    list.iter().any(|s| Arc::ptr_eq(s, snapshot))
}

impl std::fmt::Debug for DatedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatedCache")
            .field("id", &self.id)
            .field("entity", &self.descriptor.name)
            .field("mode", &self.config.mode)
            .field("snapshots", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::source::VecSource;
    use crate::model::{Attribute, AttributeKind, Row, Value};
    use crate::temporal::Rectangle;
    use assert_matches::assert_matches;

    fn ts(text: &str) -> Timestamp {
        Timestamp::parse(text).unwrap()
    }

    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::new("Balance")
            .attribute(Attribute::new("id", AttributeKind::Int))
            .attribute(Attribute::new("desk", AttributeKind::Str))
            .attribute(Attribute::new("qty", AttributeKind::Int))
            .primary_key(["id"])
            .business_dated("from_z", "thru_z")
            .processing_dated("in_z", "out_z")
            .index("by_desk", ["desk"], IndexKind::NonUnique)
    }

    fn cache() -> DatedCache {
        DatedCache::new(descriptor(), CacheConfig::default()).unwrap()
    }

    fn balance(id: i64, desk: &str, qty: i64, processing: (&str, &str)) -> Snapshot {
        Snapshot::builder(vec![Value::Int(id)])
            .attribute("id", id)
            .attribute("desk", desk)
            .attribute("qty", qty)
            .rectangle(Rectangle::new(
                Interval::open_from(ts("2002-01-01")),
                Interval::parse(processing.0, processing.1).unwrap(),
            ))
            .build()
            .unwrap()
    }

    #[test]
    fn test_put_then_find() {
        let cache = cache();
        let stored = cache
            .put_dated_data(balance(1, "FX", 10, ("2002-01-02", "infinity")))
            .unwrap();
        let found = cache
            .find(&IndexKey::single(1), Some(ts("2003-01-01")), None)
            .unwrap()
            .unwrap();
        assert_eq!(*found, *stored);
        assert!(cache.find(&IndexKey::single(2), None, None).unwrap().is_none());

        let metrics = cache.metrics().snapshot();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.snapshots, 1);
    }

    #[test]
    fn test_update_keeps_secondaries_in_line() {
        let cache = cache();
        let id = IndexKey::single(1);
        cache.insert(balance(1, "FX", 10, ("2002-01-02", "infinity"))).unwrap();

        let changes: Changes = [("desk".to_string(), Value::from("RATES"))].into();
        cache.update(&id, ts("2002-02-01"), changes).unwrap();

        assert_eq!(cache.history(&id).len(), 2);
        let desk = cache.index_ref("by_desk").unwrap();
        let fx = cache.find_by_index(desk, &IndexKey::single("FX")).unwrap();
        assert_eq!(fx.len(), 1);
        assert!(!fx[0].is_open());
        let rates = cache
            .find_by_index_as_of(desk, &IndexKey::single("RATES"), None, None)
            .unwrap();
        assert_eq!(rates.len(), 1);
        assert_eq!(rates[0].processing().from(), ts("2002-02-01"));

        cache.terminate(&id, ts("2002-03-01")).unwrap();
        assert!(cache.find(&id, None, None).unwrap().is_none());
        let past = cache
            .find(&id, Some(ts("2002-06-01")), Some(ts("2002-02-15")))
            .unwrap()
            .unwrap();
        assert_eq!(past.attribute("desk"), Some(&Value::from("RATES")));
    }

    #[test]
    fn test_update_open_version_starting_later_in_business_time() {
        let cache = cache();
        let id = IndexKey::single(1);
        let later = balance(1, "FX", 10, ("2002-01-02", "infinity")).with_rectangle(
            Rectangle::new(
                Interval::open_from(ts("2005-01-01")),
                Interval::open_from(ts("2002-01-02")),
            ),
        );
        cache.insert(later).unwrap();

        let changes: Changes = [("qty".to_string(), Value::Int(11))].into();
        cache.update(&id, ts("2002-02-01"), changes).unwrap();

        assert_eq!(cache.history(&id).len(), 2);
        let current = cache
            .find(&id, Some(ts("2006-01-01")), None)
            .unwrap()
            .unwrap();
        assert_eq!(current.attribute("qty"), Some(&Value::Int(11)));
    }

    #[test]
    fn test_insert_rejects_overlap_but_bulk_load_does_not() {
        let cache = cache();
        cache.insert(balance(1, "FX", 10, ("2002-01-02", "infinity"))).unwrap();
        assert_matches!(
            cache.insert(balance(1, "FX", 11, ("2002-01-05", "infinity"))),
            Err(Error::DuplicateKey { .. })
        );
        cache
            .put_dated_data(balance(1, "FX", 11, ("2002-01-05", "infinity")))
            .unwrap();
        assert_eq!(cache.collect_milestoning_overlaps().unwrap().len(), 2);
        assert_matches!(
            cache.find(&IndexKey::single(1), None, None),
            Err(Error::AmbiguousResult { .. })
        );
    }

    #[test]
    fn test_index_reference_from_other_cache_rejected() {
        let a = cache();
        let b = cache();
        let reference = a.index_ref(PRIMARY_INDEX).unwrap();
        assert!(reference.is_for_cache(a.id()));
        assert!(!reference.is_for_cache(b.id()));
        assert_matches!(
            b.find_by_index(reference, &IndexKey::single(1)),
            Err(Error::StaleReference { .. })
        );
        assert_matches!(
            a.find_by_index(IndexReference::new(a.id(), 0), &IndexKey::single(1)),
            Err(Error::StaleReference { .. })
        );
        assert_eq!(a.best_index_reference(&["id"]), Some(reference));
        assert_eq!(
            a.best_index_reference(&["desk"]),
            Some(a.index_ref("by_desk").unwrap())
        );
        assert_eq!(a.best_index_reference(&["qty"]), None);
    }

    #[test]
    fn test_invalidate() {
        let cache = cache();
        cache.put_dated_data(balance(1, "FX", 10, ("2002-01-02", "infinity"))).unwrap();
        cache.put_dated_data(balance(2, "FX", 10, ("2002-01-02", "infinity"))).unwrap();
        cache.relate(&IndexKey::single(1), "peer", IndexKey::single(2));

        assert_eq!(cache.invalidate(&IndexKey::single(1)).unwrap(), 1);
        assert_eq!(cache.identity_count(), 1);
        let desk = cache.index_ref("by_desk").unwrap();
        assert_eq!(cache.find_by_index(desk, &IndexKey::single("FX")).unwrap().len(), 1);

        cache.invalidate_all();
        assert!(cache.is_empty());
        assert!(cache.find_by_index(desk, &IndexKey::single("FX")).unwrap().is_empty());
    }

    #[test]
    fn test_related_resolves_as_of() {
        let cache = cache();
        cache.insert(balance(1, "FX", 10, ("2002-01-02", "infinity"))).unwrap();
        cache.insert(balance(2, "FX", 20, ("2002-01-02", "infinity"))).unwrap();
        cache.relate(&IndexKey::single(1), "hedge", IndexKey::single(2));

        let changes: Changes = [("qty".to_string(), Value::Int(25))].into();
        cache.update(&IndexKey::single(2), ts("2002-02-01"), changes).unwrap();

        let now = cache.related(&IndexKey::single(1), "hedge", None, None).unwrap();
        assert_eq!(now[0].attribute("qty"), Some(&Value::Int(25)));
        let then = cache
            .related(&IndexKey::single(1), "hedge", None, Some(ts("2002-01-15")))
            .unwrap();
        assert_eq!(then[0].attribute("qty"), Some(&Value::Int(20)));
    }

    #[test]
    fn test_partial_cache_loads_on_miss() {
        let cache = DatedCache::new(descriptor(), CacheConfig::partial()).unwrap();
        let row = |id: i64| -> Row {
            serde_json::json!({
                "id": id, "desk": "FX", "qty": 1,
                "from_z": "2002-01-01", "in_z": "2002-01-02"
            })
            .as_object()
            .cloned()
            .unwrap()
        };
        let source = VecSource::new(descriptor(), vec![row(1), row(2)]);
        let id = IndexKey::single(1);

        assert!(cache.find_or_load(&id, None, None, &source).unwrap().is_some());
        assert!(cache.find_or_load(&id, None, None, &source).unwrap().is_some());
        assert_eq!(source.fetch_count(&id), 1);
        assert_eq!(cache.identity_count(), 1);

        let missing = IndexKey::single(9);
        assert!(cache.find_or_load(&missing, None, None, &source).unwrap().is_none());
    }

    #[test]
    fn test_load_full_and_purge() {
        let cache = cache();
        let rows: Vec<Row> = (0..4)
            .map(|id| {
                serde_json::json!({
                    "id": id, "desk": "FX", "qty": id,
                    "from_z": "2002-01-01", "in_z": "2002-01-02", "out_z": "2002-01-03"
                })
                .as_object()
                .cloned()
                .unwrap()
            })
            .collect();
        let source = VecSource::new(descriptor(), rows);
        assert_eq!(cache.load_full(&source).unwrap(), 4);
        assert_eq!(cache.purge_closed_before(ts("2002-01-03")).unwrap(), 4);
        assert!(cache.is_empty());
        let desk = cache.index_ref("by_desk").unwrap();
        assert!(cache.find_by_index(desk, &IndexKey::single("FX")).unwrap().is_empty());
    }

    #[test]
    fn test_interned_attributes_share_storage() {
        let config = CacheConfig {
            interned_attributes: vec!["desk".to_string()],
            ..CacheConfig::default()
        };
        let cache = DatedCache::new(descriptor(), config).unwrap();
        let a = cache.put_dated_data(balance(1, "FX", 1, ("2002-01-02", "infinity"))).unwrap();
        let b = cache.put_dated_data(balance(2, "FX", 1, ("2002-01-02", "infinity"))).unwrap();
        match (a.attribute("desk"), b.attribute("desk")) {
            (Some(Value::Str(x)), Some(Value::Str(y))) => assert!(Arc::ptr_eq(x, y)),
            other => panic!("unexpected attributes {:?}", other),
        }
        assert_eq!(cache.string_index().len(), 1);
    }

    #[test]
    fn test_unique_secondary_on_non_dated_entity() {
        let descriptor = EntityDescriptor::new("Currency")
            .attribute(Attribute::new("code", AttributeKind::Str))
            .attribute(Attribute::new("iso", AttributeKind::Int))
            .primary_key(["code"])
            .index("by_iso", ["iso"], IndexKind::Unique);
        let cache = DatedCache::new(descriptor, CacheConfig::default()).unwrap();
        let currency = |code: &str, iso: i64| {
            Snapshot::builder(vec![Value::from(code)])
                .attribute("code", code)
                .attribute("iso", iso)
                .build()
                .unwrap()
        };
        cache.insert(currency("USD", 840)).unwrap();
        assert_matches!(
            cache.insert(currency("XXX", 840)),
            Err(Error::DuplicateKey { .. })
        );

        // Re-keying the same identity in place frees the old key
        let changes: Changes = [("iso".to_string(), Value::Int(841))].into();
        cache.update(&IndexKey::single("USD"), Timestamp::now(), changes).unwrap();
        cache.insert(currency("XXX", 840)).unwrap();
        let iso = cache.index_ref("by_iso").unwrap();
        assert_eq!(cache.find_by_index(iso, &IndexKey::single(841)).unwrap().len(), 1);
    }
}
