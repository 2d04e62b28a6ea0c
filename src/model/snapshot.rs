//! Entity snapshots

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::value::{IndexKey, Value};
use crate::error::Result;
use crate::temporal::{Interval, Rectangle, Timestamp};

/// One immutable version of an entity
///
/// The identity is the key over the primary-key attributes, which are also
/// present in `attributes`. Snapshots are never mutated once cached; an
/// update closes the old one and adds a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    identity: IndexKey,
    rectangle: Rectangle,
    attributes: BTreeMap<String, Value>,
}

impl Snapshot {
    /// Start building a snapshot for the given identity values
    pub fn builder(identity: Vec<Value>) -> SnapshotBuilder {
        SnapshotBuilder {
            identity: IndexKey::new(identity),
            rectangle: Rectangle::full(),
            attributes: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn identity(&self) -> &IndexKey {
        &self.identity
    }

    #[inline]
    pub fn rectangle(&self) -> &Rectangle {
        &self.rectangle
    }

    #[inline]
    pub fn business(&self) -> &Interval {
        &self.rectangle.business
    }

    #[inline]
    pub fn processing(&self) -> &Interval {
        &self.rectangle.processing
    }

    /// Processing interval still open
    #[inline]
    pub fn is_open(&self) -> bool {
        self.rectangle.is_open()
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    /// Same identity and payload over a different rectangle
    pub fn with_rectangle(&self, rectangle: Rectangle) -> Snapshot {
        Snapshot {
            identity: self.identity.clone(),
            rectangle,
            attributes: self.attributes.clone(),
        }
    }

    /// Copy with the processing interval closed at `at`
    pub fn closed_at(&self, at: Timestamp) -> Snapshot {
        self.with_rectangle(Rectangle::new(
            self.rectangle.business,
            self.rectangle.processing.closed_at(at),
        ))
    }

    /// Copy with some attributes replaced
    pub fn with_attributes<'a>(
        &self,
        changes: impl IntoIterator<Item = (&'a String, &'a Value)>,
    ) -> Snapshot {
        let mut attributes = self.attributes.clone();
        for (name, value) in changes {
            attributes.insert(name.clone(), value.clone());
        }
        Snapshot {
            identity: self.identity.clone(),
            rectangle: self.rectangle,
            attributes,
        }
    }

    /// Replace string values with their canonical interned copies
    pub(crate) fn map_strings(&mut self, mut intern: impl FnMut(&str, &Arc<str>) -> Arc<str>) {
        for (name, value) in self.attributes.iter_mut() {
            if let Value::Str(s) = value {
                *s = intern(name, s);
            }
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.identity, self.rectangle)
    }
}

/// Builder for [`Snapshot`]
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    identity: IndexKey,
    rectangle: Rectangle,
    attributes: BTreeMap<String, Value>,
}

impl SnapshotBuilder {
    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn rectangle(mut self, rectangle: Rectangle) -> Self {
        self.rectangle = rectangle;
        self
    }

    pub fn business(mut self, business: Interval) -> Self {
        self.rectangle.business = business;
        self
    }

    pub fn processing(mut self, processing: Interval) -> Self {
        self.rectangle.processing = processing;
        self
    }

    /// Finish; degenerate rectangles are rejected here so they can never
    /// reach an index
    pub fn build(self) -> Result<Snapshot> {
        self.rectangle.validate(&self.identity)?;
        Ok(Snapshot {
            identity: self.identity,
            rectangle: self.rectangle,
            attributes: self.attributes,
        })
    }
}

// =============================================================================
// Overlap Report
// =============================================================================

/// Two snapshots of one identity whose rectangles overlap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlapPair {
    /// The earlier-recorded version
    pub original: Arc<Snapshot>,
    /// The version that should not coexist with it
    pub duplicate: Arc<Snapshot>,
}

impl OverlapPair {
    pub fn identity(&self) -> &IndexKey {
        self.original.identity()
    }
}

/// Serializable view of an overlap, used by the CLI report
#[derive(Debug, Clone, Serialize)]
pub struct OverlapRecord {
    pub identity: String,
    pub original: Rectangle,
    pub duplicate: Rectangle,
}

impl From<&OverlapPair> for OverlapRecord {
    fn from(pair: &OverlapPair) -> Self {
        Self {
            identity: pair.identity().to_string(),
            original: *pair.original.rectangle(),
            duplicate: *pair.duplicate.rectangle(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_builder_defaults_to_full_rectangle() {
        let s = Snapshot::builder(vec![Value::Int(1)])
            .attribute("id", 1)
            .build()
            .unwrap();
        assert_eq!(s.rectangle(), &Rectangle::full());
        assert!(s.is_open());
        assert_eq!(s.identity(), &IndexKey::single(1));
    }

    #[test]
    fn test_builder_rejects_degenerate() {
        let result = Snapshot::builder(vec![Value::Int(1)])
            .processing(Interval::parse("2002-01-02", "2002-01-02").unwrap())
            .build();
        assert!(matches!(
            result,
            Err(Error::DegenerateInterval { axis: "processing", .. })
        ));
    }

    #[test]
    fn test_closed_at_and_changes() {
        let s = Snapshot::builder(vec![Value::Int(1)])
            .attribute("qty", 5)
            .processing(Interval::open_from(Timestamp::parse("2002-01-01").unwrap()))
            .build()
            .unwrap();
        let at = Timestamp::parse("2002-02-01").unwrap();
        let closed = s.closed_at(at);
        assert!(!closed.is_open());
        assert_eq!(closed.processing().to(), at);

        let changes: BTreeMap<String, Value> = [("qty".to_string(), Value::Int(9))].into();
        let changed = s.with_attributes(&changes);
        assert_eq!(changed.attribute("qty"), Some(&Value::Int(9)));
        assert_eq!(s.attribute("qty"), Some(&Value::Int(5)));
    }
}
