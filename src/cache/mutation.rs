//! Milestoning mutations
//!
//! A mutation is applied to one identity's version chain and yields the new
//! chain. [`apply`] is pure: both the direct cache path and the transaction
//! staging area run the same transformation, and nothing is published until
//! the caller swaps the returned chain in.
//!
//! ```text
//!  update at t (processing dated)
//!
//!  before:  [b0, INF) × [p0, INF)   v1
//!  after:   [b0, INF) × [p0, t)     v1   closed
//!           [b0, INF) × [t,  INF)   v2   open
//!
//!  update at t (business dated only)
//!
//!  before:  [b0, INF)               v1
//!  after:   [b0, t)                 v1
//!           [t,  INF)               v2
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::model::{EntityDescriptor, IndexKey, Snapshot, Value};
use crate::temporal::{Interval, Rectangle, Timestamp};

/// Attribute changes carried by an update
pub type Changes = BTreeMap<String, Value>;

/// One write against the cache
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Add a new snapshot; rejected if it overlaps an existing version
    Insert(Snapshot),
    /// Replace the payload of the open version from processing time `at`
    /// onward. `business_as_of` picks the version when given; otherwise the
    /// single open version is used, and `at` only breaks ties between
    /// several open versions. On a business-dated entity without a
    /// processing axis the business range is split at the as-of date.
    Update {
        identity: IndexKey,
        at: Timestamp,
        business_as_of: Option<Timestamp>,
        changes: Changes,
    },
    /// Replace the payload only over the business range `business`
    UpdateUntil {
        identity: IndexKey,
        at: Timestamp,
        business: Interval,
        changes: Changes,
    },
    /// Close the open versions at `at`
    Terminate { identity: IndexKey, at: Timestamp },
}

impl Mutation {
    pub fn identity(&self) -> &IndexKey {
        match self {
            Mutation::Insert(snapshot) => snapshot.identity(),
            Mutation::Update { identity, .. }
            | Mutation::UpdateUntil { identity, .. }
            | Mutation::Terminate { identity, .. } => identity,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::Insert(_) => "insert",
            Mutation::Update { .. } => "update",
            Mutation::UpdateUntil { .. } => "update_until",
            Mutation::Terminate { .. } => "terminate",
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Mutation::Insert(_))
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.identity())
    }
}

/// Apply `mutation` to `chain`, returning the new chain
pub fn apply(
    chain: &[Arc<Snapshot>],
    mutation: &Mutation,
    descriptor: &EntityDescriptor,
) -> Result<Vec<Arc<Snapshot>>> {
    match mutation {
        Mutation::Insert(snapshot) => insert(chain, snapshot),
        Mutation::Terminate { identity, at } => terminate(chain, identity, *at, descriptor),
        Mutation::Update {
            identity,
            at,
            business_as_of,
            changes,
        } => {
            check_changes(identity, changes, descriptor)?;
            update(chain, identity, *at, *business_as_of, changes, descriptor)
        }
        Mutation::UpdateUntil {
            identity,
            at,
            business,
            changes,
        } => {
            check_changes(identity, changes, descriptor)?;
            if !descriptor.is_business_dated() {
                return Err(Error::NonRetriableBusiness(format!(
                    "{} is not business dated; update_until needs a business axis",
                    descriptor.name
                )));
            }
            update_until(chain, identity, *at, business, changes, descriptor)
        }
    }
}

fn insert(chain: &[Arc<Snapshot>], snapshot: &Snapshot) -> Result<Vec<Arc<Snapshot>>> {
    if let Some(existing) = chain
        .iter()
        .find(|s| s.rectangle().overlaps(snapshot.rectangle()))
    {
        return Err(Error::DuplicateKey {
            index: crate::model::PRIMARY_INDEX.to_string(),
            key: snapshot.identity().to_string(),
            existing: existing.rectangle().to_string(),
            incoming: snapshot.rectangle().to_string(),
        });
    }
    let mut next = chain.to_vec();
    next.push(Arc::new(snapshot.clone()));
    Ok(next)
}

fn terminate(
    chain: &[Arc<Snapshot>],
    identity: &IndexKey,
    at: Timestamp,
    descriptor: &EntityDescriptor,
) -> Result<Vec<Arc<Snapshot>>> {
    if !descriptor.is_dated() {
        if chain.is_empty() {
            return Err(Error::UnknownIdentity(identity.to_string()));
        }
        return Ok(Vec::new());
    }

    let processing_dated = descriptor.is_processing_dated();
    let is_open = |s: &Snapshot| {
        if processing_dated {
            s.is_open()
        } else {
            s.business().is_open()
        }
    };
    if !chain.iter().any(|s| is_open(s)) {
        return Err(Error::UnknownIdentity(identity.to_string()));
    }

    let mut next = Vec::with_capacity(chain.len());
    for snapshot in chain {
        if !is_open(snapshot) {
            next.push(Arc::clone(snapshot));
            continue;
        }
        let closed = if processing_dated {
            close_processing(snapshot, at)?
        } else {
            close_business(snapshot, at)?
        };
        next.extend(closed.map(Arc::new));
    }
    Ok(next)
}

fn update(
    chain: &[Arc<Snapshot>],
    identity: &IndexKey,
    at: Timestamp,
    business_as_of: Option<Timestamp>,
    changes: &Changes,
    descriptor: &EntityDescriptor,
) -> Result<Vec<Arc<Snapshot>>> {
    let processing_dated = descriptor.is_processing_dated();
    let business_dated = descriptor.is_business_dated();
    let candidate = |s: &Snapshot| {
        if processing_dated {
            s.is_open()
        } else if business_dated && business_as_of.is_none() {
            s.business().is_open()
        } else {
            true
        }
    };
    let mut targets: Vec<usize> = chain
        .iter()
        .enumerate()
        .filter(|(_, s)| candidate(s))
        .map(|(i, _)| i)
        .collect();
    if let Some(as_of) = business_as_of.or((targets.len() > 1).then_some(at)) {
        targets.retain(|&i| chain[i].business().contains(as_of));
    }
    let target = match targets.as_slice() {
        [] => return Err(Error::UnknownIdentity(identity.to_string())),
        [one] => *one,
        many => {
            return Err(Error::AmbiguousResult {
                identity: identity.to_string(),
                matches: many.len(),
            })
        }
    };

    let current = &chain[target];
    let mut next: Vec<Arc<Snapshot>> = chain
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != target)
        .map(|(_, s)| Arc::clone(s))
        .collect();

    if !processing_dated {
        let business = current.business();
        let split = business_as_of.unwrap_or(at);
        if business_dated && split > business.from() && split < business.to() {
            next.push(Arc::new(current.with_rectangle(Rectangle::new(
                business.closed_at(split),
                *current.processing(),
            ))));
            next.push(Arc::new(current.with_attributes(changes).with_rectangle(
                Rectangle::new(business.starting_at(split), *current.processing()),
            )));
        } else {
            next.push(Arc::new(current.with_attributes(changes)));
        }
        return Ok(next);
    }

    if current.processing().from() == at {
        // Nothing to milestone: rewrite the version in place
        next.push(Arc::new(current.with_attributes(changes)));
        return Ok(next);
    }

    next.extend(close_processing(current, at)?.map(Arc::new));
    let replacement = current
        .with_attributes(changes)
        .with_rectangle(Rectangle::new(*current.business(), Interval::open_from(at)));
    next.push(Arc::new(replacement));
    Ok(next)
}

fn update_until(
    chain: &[Arc<Snapshot>],
    identity: &IndexKey,
    at: Timestamp,
    business: &Interval,
    changes: &Changes,
    descriptor: &EntityDescriptor,
) -> Result<Vec<Arc<Snapshot>>> {
    if business.is_degenerate() {
        return Err(Error::DegenerateInterval {
            identity: identity.to_string(),
            axis: "business",
            from: business.from().to_string(),
            to: business.to().to_string(),
        });
    }
    let processing_dated = descriptor.is_processing_dated();
    let affected = |s: &Snapshot| {
        (!processing_dated || s.is_open()) && s.business().overlaps(business)
    };
    if !chain.iter().any(|s| affected(s)) {
        return Err(Error::UnknownIdentity(identity.to_string()));
    }

    let before = Interval::new(Timestamp::MIN, business.from())?;
    let after = Interval::new(business.to(), Timestamp::INFINITY)?;

    let mut next = Vec::with_capacity(chain.len() + 3);
    for snapshot in chain {
        if !affected(snapshot) {
            next.push(Arc::clone(snapshot));
            continue;
        }

        let processing = if processing_dated && snapshot.processing().from() != at {
            next.extend(close_processing(snapshot, at)?.map(Arc::new));
            Interval::open_from(at)
        } else {
            *snapshot.processing()
        };

        let old = snapshot.business();
        if let Some(head) = old.intersection(&before) {
            next.push(Arc::new(snapshot.with_rectangle(Rectangle::new(head, processing))));
        }
        if let Some(middle) = old.intersection(business) {
            let changed = snapshot
                .with_attributes(changes)
                .with_rectangle(Rectangle::new(middle, processing));
            next.push(Arc::new(changed));
        }
        if let Some(tail) = old.intersection(&after) {
            next.push(Arc::new(snapshot.with_rectangle(Rectangle::new(tail, processing))));
        }
    }
    Ok(next)
}

/// Close the processing interval at `at`; a version opened exactly at `at`
/// disappears instead of becoming degenerate
fn close_processing(snapshot: &Snapshot, at: Timestamp) -> Result<Option<Snapshot>> {
    close_axis(at, snapshot.processing(), "processing").map(|keep| {
        keep.then(|| snapshot.closed_at(at))
    })
}

fn close_business(snapshot: &Snapshot, at: Timestamp) -> Result<Option<Snapshot>> {
    close_axis(at, snapshot.business(), "business").map(|keep| {
        keep.then(|| {
            snapshot.with_rectangle(Rectangle::new(
                snapshot.business().closed_at(at),
                *snapshot.processing(),
            ))
        })
    })
}

fn close_axis(at: Timestamp, interval: &Interval, axis: &'static str) -> Result<bool> {
    if interval.from() > at {
        return Err(Error::InvalidInterval {
            axis,
            from: interval.from().to_string(),
            to: at.to_string(),
        });
    }
    Ok(interval.from() < at)
}

fn check_changes(
    identity: &IndexKey,
    changes: &Changes,
    descriptor: &EntityDescriptor,
) -> Result<()> {
    for (name, value) in changes {
        if descriptor.is_immutable(name) {
            return Err(Error::NonRetriableBusiness(format!(
                "attribute '{}' of {} {} is immutable",
                name, descriptor.name, identity
            )));
        }
        let attribute = descriptor.find_attribute(name).ok_or_else(|| {
            Error::NonRetriableBusiness(format!(
                "{} has no attribute '{}'",
                descriptor.name, name
            ))
        })?;
        if !attribute.kind.accepts(value) || (value.is_null() && !attribute.nullable) {
            return Err(Error::AttributeMismatch {
                identity: identity.to_string(),
                attribute: name.clone(),
            });
        }
    }
    Ok(())
}
