//! Unit of work over one dated cache
//!
//! A transaction never touches the cache before commit. Mutations are applied
//! to private copies of the affected version chains, reads see those copies
//! first, and commit publishes every staged chain under the stripe locks of
//! the written identities after checking that none of them moved since the
//! transaction first looked at it. The staged chains are swapped in together,
//! so no reader sees part of a commit.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::style::TransactionStyle;
use crate::cache::mutation::{self, Changes, Mutation};
use crate::cache::DatedCache;
use crate::error::{Error, Result};
use crate::model::{IndexKey, Snapshot};
use crate::temporal::{Interval, Timestamp};

// =============================================================================
// Transaction State Machine
// =============================================================================

/// States of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionState {
    /// Accepting reads and writes
    Active,
    /// Publishing staged chains
    Committing,
    /// All staged chains published
    Committed,
    /// Discarding staged chains
    RollingBack,
    /// Nothing was published
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Active => write!(f, "Active"),
            TransactionState::Committing => write!(f, "Committing"),
            TransactionState::Committed => write!(f, "Committed"),
            TransactionState::RollingBack => write!(f, "RollingBack"),
            TransactionState::RolledBack => write!(f, "RolledBack"),
        }
    }
}

// =============================================================================
// Transaction
// =============================================================================

pub struct Transaction<'c> {
    id: Uuid,
    cache: &'c DatedCache,
    style: TransactionStyle,
    started: Instant,
    state: TransactionState,
    /// Nesting depth of `join` calls
    depth: u32,
    /// Chain version of every identity at first touch
    read_versions: HashMap<IndexKey, u64>,
    /// Private copies of written chains
    staged: HashMap<IndexKey, Vec<Arc<Snapshot>>>,
    /// Written identities in first-write order
    write_order: Vec<IndexKey>,
    mutations: usize,
}

impl<'c> Transaction<'c> {
    /// Start a transaction against `cache`
    pub fn begin(cache: &'c DatedCache, style: TransactionStyle) -> Self {
        let id = Uuid::new_v4();
        debug!(tx = %id, entity = %cache.descriptor().name, "Transaction started");
        Self {
            id,
            cache,
            style,
            started: Instant::now(),
            state: TransactionState::Active,
            depth: 0,
            read_versions: HashMap::new(),
            staged: HashMap::new(),
            write_order: Vec::new(),
            mutations: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn style(&self) -> &TransactionStyle {
        &self.style
    }

    /// Number of mutations staged so far
    pub fn mutation_count(&self) -> usize {
        self.mutations
    }

    /// Current nesting depth; 0 outside any `join`
    pub fn depth(&self) -> u32 {
        self.depth
    }

    fn ensure_active(&self, operation: &'static str) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(Error::TransactionState {
                id: self.id.to_string(),
                state: self.state.to_string(),
                operation,
            });
        }
        Ok(())
    }

    fn remaining(&self) -> Result<Duration> {
        self.style
            .timeout()
            .checked_sub(self.started.elapsed())
            .filter(|d| !d.is_zero())
            .ok_or_else(|| {
                Error::lock_timeout(format!(
                    "transaction {} exceeded its {:?} timeout",
                    self.id,
                    self.style.timeout()
                ))
            })
    }

    /// The chain as this transaction sees it
    fn visible_chain(&mut self, identity: &IndexKey) -> Vec<Arc<Snapshot>> {
        if let Some(staged) = self.staged.get(identity) {
            return staged.clone();
        }
        let (chain, version) = self.cache.chain(identity);
        self.read_versions.entry(identity.clone()).or_insert(version);
        chain
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Point lookup that sees this transaction's own writes
    pub fn find(
        &mut self,
        identity: &IndexKey,
        business: Option<Timestamp>,
        processing: Option<Timestamp>,
    ) -> Result<Option<Arc<Snapshot>>> {
        self.ensure_active("find")?;
        let business = business.unwrap_or_else(Timestamp::now);
        let processing = processing.unwrap_or(Timestamp::INFINITY);
        let mut matches: Vec<_> = self
            .visible_chain(identity)
            .into_iter()
            .filter(|s| s.rectangle().contains(business, processing))
            .collect();
        match matches.len() {
            0 | 1 => Ok(matches.pop()),
            n => Err(Error::AmbiguousResult {
                identity: identity.to_string(),
                matches: n,
            }),
        }
    }

    /// Full history of an identity as this transaction sees it
    pub fn history(&mut self, identity: &IndexKey) -> Result<Vec<Arc<Snapshot>>> {
        self.ensure_active("history")?;
        Ok(self.visible_chain(identity))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Stage a mutation
    pub fn apply(&mut self, mutation: Mutation) -> Result<()> {
        self.ensure_active("write")?;
        let identity = mutation.identity().clone();
        let chain = self.visible_chain(&identity);
        let next = mutation::apply(&chain, &mutation, self.cache.descriptor())?;
        if !self.staged.contains_key(&identity) {
            self.write_order.push(identity.clone());
        }
        self.staged.insert(identity, next);
        self.mutations += 1;
        Ok(())
    }

    pub fn insert(&mut self, snapshot: Snapshot) -> Result<()> {
        self.apply(Mutation::Insert(snapshot))
    }

    pub fn update(&mut self, identity: &IndexKey, at: Timestamp, changes: Changes) -> Result<()> {
        self.apply(Mutation::Update {
            identity: identity.clone(),
            at,
            business_as_of: None,
            changes,
        })
    }

    pub fn update_as_of(
        &mut self,
        identity: &IndexKey,
        at: Timestamp,
        business_as_of: Timestamp,
        changes: Changes,
    ) -> Result<()> {
        self.apply(Mutation::Update {
            identity: identity.clone(),
            at,
            business_as_of: Some(business_as_of),
            changes,
        })
    }

    pub fn update_until(
        &mut self,
        identity: &IndexKey,
        at: Timestamp,
        business: Interval,
        changes: Changes,
    ) -> Result<()> {
        self.apply(Mutation::UpdateUntil {
            identity: identity.clone(),
            at,
            business,
            changes,
        })
    }

    pub fn terminate(&mut self, identity: &IndexKey, at: Timestamp) -> Result<()> {
        self.apply(Mutation::Terminate {
            identity: identity.clone(),
            at,
        })
    }

    /// Run a nested unit of work inside this transaction. Its writes become
    /// part of this transaction and its failures, retry requests included,
    /// propagate to the outermost unit of work.
    pub fn join<T>(&mut self, work: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.ensure_active("join")?;
        self.depth += 1;
        let result = work(self);
        self.depth -= 1;
        result
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Publish every staged chain, or nothing
    #[instrument(skip(self), fields(tx = %self.id, writes = self.write_order.len()))]
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active("commit")?;
        if self.depth > 0 {
            return Err(Error::TransactionState {
                id: self.id.to_string(),
                state: format!("{} (nested)", self.state),
                operation: "commit",
            });
        }
        self.state = TransactionState::Committing;
        match self.publish() {
            Ok(()) => {
                self.state = TransactionState::Committed;
                self.cache.metrics().record_commit();
                debug!(mutations = self.mutations, "Transaction committed");
                Ok(())
            }
            Err(e) => {
                self.discard();
                Err(e)
            }
        }
    }

    fn publish(&mut self) -> Result<()> {
        if self.write_order.is_empty() {
            return Ok(());
        }
        let timeout = self.remaining()?;
        let _locks = self.cache.lock_identities(self.write_order.iter(), timeout)?;

        for identity in &self.write_order {
            let expected = self.read_versions.get(identity).copied().unwrap_or(0);
            let current = self.cache.chain_version(identity);
            if current != expected {
                return Err(Error::conflict(format!(
                    "{} changed since it was read (version {} -> {})",
                    identity, expected, current
                )));
            }
        }

        let chains: Vec<(IndexKey, Vec<Arc<Snapshot>>)> = self
            .write_order
            .iter()
            .filter_map(|identity| {
                self.staged
                    .get(identity)
                    .map(|next| (identity.clone(), next.clone()))
            })
            .collect();
        self.cache.publish_all(chains).inspect_err(|e| {
            warn!(error = %e, "Commit rejected, nothing published");
        })
    }

    /// Discard staged work
    pub fn rollback(&mut self) -> Result<()> {
        match self.state {
            TransactionState::RolledBack => Ok(()),
            TransactionState::Active => {
                self.discard();
                debug!(tx = %self.id, "Transaction rolled back");
                Ok(())
            }
            _ => Err(Error::TransactionState {
                id: self.id.to_string(),
                state: self.state.to_string(),
                operation: "rollback",
            }),
        }
    }

    fn discard(&mut self) {
        self.state = TransactionState::RollingBack;
        self.staged.clear();
        self.write_order.clear();
        self.read_versions.clear();
        self.state = TransactionState::RolledBack;
        self.cache.metrics().record_rollback();
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("writes", &self.write_order.len())
            .field("mutations", &self.mutations)
            .finish()
    }
}
