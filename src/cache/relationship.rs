//! Relationship edge table
//!
//! Related objects are stored as identities, not object references, and
//! resolved through the cache at read time, so a related object is always
//! seen at the caller's as-of point.

use dashmap::DashMap;

use crate::model::IndexKey;

/// `(from identity, relation name) -> [to identity]`
#[derive(Debug, Default)]
pub struct RelationshipTable {
    edges: DashMap<(IndexKey, String), Vec<IndexKey>>,
}

impl RelationshipTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an edge; duplicate edges are ignored
    pub fn relate(&self, from: &IndexKey, relation: &str, to: IndexKey) {
        let mut targets = self
            .edges
            .entry((from.clone(), relation.to_string()))
            .or_default();
        if !targets.contains(&to) {
            targets.push(to);
        }
    }

    /// Remove one edge
    pub fn unrelate(&self, from: &IndexKey, relation: &str, to: &IndexKey) -> bool {
        let key = (from.clone(), relation.to_string());
        let removed = match self.edges.get_mut(&key) {
            Some(mut targets) => {
                let before = targets.len();
                targets.retain(|t| t != to);
                targets.len() != before
            }
            None => false,
        };
        self.edges.remove_if(&key, |_, targets| targets.is_empty());
        removed
    }

    /// Target identities of a relation
    pub fn targets(&self, from: &IndexKey, relation: &str) -> Vec<IndexKey> {
        self.edges
            .get(&(from.clone(), relation.to_string()))
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    /// Drop every edge leaving `from`
    pub fn remove_from(&self, from: &IndexKey) {
        self.edges.retain(|(source, _), _| source != from);
    }

    pub fn clear(&self) {
        self.edges.clear();
    }

    /// Number of (from, relation) entries
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}
