//! Upstream data sources
//!
//! The cache never talks to a database itself. A [`DataSource`] delivers raw
//! rows and maps each row to exactly one snapshot and one primary key.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::model::{EntityDescriptor, IndexKey, Row, Snapshot};

/// Rows for one entity type
pub trait DataSource: Send + Sync {
    /// Descriptor used to interpret rows
    fn descriptor(&self) -> &EntityDescriptor;

    /// Every row, for a full cache load
    fn fetch_all(&self) -> Result<Vec<Row>>;

    /// Every row of one identity, all versions
    fn fetch(&self, identity: &IndexKey) -> Result<Vec<Row>>;

    /// Map a row to a snapshot
    fn create_object_from(&self, row: &Row) -> Result<Snapshot> {
        self.descriptor().snapshot_from_row(row)
    }

    /// Map a row to its primary key
    fn primary_key_from(&self, row: &Row) -> Result<IndexKey> {
        self.descriptor().identity_from_row(row)
    }
}

/// In-memory source backed by a row list; also counts fetches so callers can
/// tell cache hits from loads
pub struct VecSource {
    descriptor: EntityDescriptor,
    rows: RwLock<Vec<Row>>,
    fetches: RwLock<HashMap<IndexKey, usize>>,
}

impl VecSource {
    pub fn new(descriptor: EntityDescriptor, rows: Vec<Row>) -> Self {
        Self {
            descriptor,
            rows: RwLock::new(rows),
            fetches: RwLock::new(HashMap::new()),
        }
    }

    /// Parse a JSON array of row objects
    pub fn from_json(descriptor: EntityDescriptor, text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let rows = value
            .as_array()
            .ok_or_else(|| Error::DataSource("expected a JSON array of rows".into()))?
            .iter()
            .map(|v| {
                v.as_object()
                    .cloned()
                    .ok_or_else(|| Error::DataSource(format!("row is not an object: {}", v)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(descriptor, rows))
    }

    /// Add a row after construction
    pub fn push(&self, row: Row) {
        self.rows.write().push(row);
    }

    /// How often `fetch` was called for an identity
    pub fn fetch_count(&self, identity: &IndexKey) -> usize {
        self.fetches.read().get(identity).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DataSource for VecSource {
    fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    fn fetch_all(&self) -> Result<Vec<Row>> {
        Ok(self.rows.read().clone())
    }

    fn fetch(&self, identity: &IndexKey) -> Result<Vec<Row>> {
        *self.fetches.write().entry(identity.clone()).or_default() += 1;
        let rows = self.rows.read();
        let mut matching = Vec::new();
        for row in rows.iter() {
            if &self.primary_key_from(row)? == identity {
                matching.push(row.clone());
            }
        }
        Ok(matching)
    }
}
