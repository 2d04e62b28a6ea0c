//! Write sinks
//!
//! A sink is where the executor's workers send their batches. The cache sink
//! runs each write in its own retrying transaction; bulk inserts share one.

use tracing::debug;

use crate::cache::Mutation;
use crate::error::Result;
use crate::model::Snapshot;
use crate::txn::{Attempt, TransactionCoordinator};

pub trait WriteSink: Send + Sync {
    /// Apply one write
    fn apply(&self, mutation: &Mutation) -> Result<()>;

    /// Insert several snapshots at once; all or nothing
    fn insert_all(&self, snapshots: &[Snapshot]) -> Result<()> {
        for snapshot in snapshots {
            self.apply(&Mutation::Insert(snapshot.clone()))?;
        }
        Ok(())
    }

    fn supports_bulk_insert(&self) -> bool {
        false
    }
}

/// Writes into a dated cache through a transaction coordinator
#[derive(Debug, Clone)]
pub struct CacheWriteSink {
    coordinator: TransactionCoordinator,
}

impl CacheWriteSink {
    pub fn new(coordinator: TransactionCoordinator) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }
}

impl WriteSink for CacheWriteSink {
    fn apply(&self, mutation: &Mutation) -> Result<()> {
        self.coordinator.execute(|tx| {
            tx.apply(mutation.clone())?;
            Ok(Attempt::Done(()))
        })
    }

    fn insert_all(&self, snapshots: &[Snapshot]) -> Result<()> {
        debug!(count = snapshots.len(), "Bulk insert");
        self.coordinator.execute(|tx| {
            for snapshot in snapshots {
                tx.insert(snapshot.clone())?;
            }
            Ok(Attempt::Done(()))
        })
    }

    fn supports_bulk_insert(&self) -> bool {
        true
    }
}
