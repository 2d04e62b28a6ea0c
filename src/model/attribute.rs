//! Attribute descriptors and extractors
//!
//! An [`Extractor`] is a closed set of cases, one per primitive semantic
//! type. Each case knows how to pull its attribute out of a snapshot, how to
//! compare two snapshots on it and how to hash it, with no trait objects on
//! the lookup path.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::snapshot::Snapshot;
use super::value::Value;
use crate::error::{Error, Result};
use crate::temporal::Timestamp;

/// Semantic type of an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    Bool,
    Int,
    Float,
    Str,
    Time,
}

impl AttributeKind {
    /// Convert a raw JSON row value to this kind
    pub fn coerce(&self, raw: &serde_json::Value) -> Option<Value> {
        use serde_json::Value as Json;
        match (self, raw) {
            (_, Json::Null) => Some(Value::Null),
            (AttributeKind::Bool, Json::Bool(b)) => Some(Value::Bool(*b)),
            (AttributeKind::Int, Json::Number(n)) => n.as_i64().map(Value::Int),
            (AttributeKind::Float, Json::Number(n)) => n.as_f64().map(Value::Float),
            (AttributeKind::Str, Json::String(s)) => Some(Value::Str(Arc::from(s.as_str()))),
            (AttributeKind::Time, Json::String(s)) => Timestamp::parse(s).ok().map(Value::Time),
            _ => None,
        }
    }

    /// Whether a value is acceptable for this kind (nulls always are)
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (AttributeKind::Bool, Value::Bool(_))
                | (AttributeKind::Int, Value::Int(_))
                | (AttributeKind::Float, Value::Float(_))
                | (AttributeKind::Str, Value::Str(_))
                | (AttributeKind::Time, Value::Time(_))
        )
    }
}

/// Describes one attribute of an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub kind: AttributeKind,
    #[serde(default)]
    pub nullable: bool,
}

impl Attribute {
    pub fn new(name: impl Into<String>, kind: AttributeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn extractor(&self) -> Extractor {
        let name: Arc<str> = Arc::from(self.name.as_str());
        match self.kind {
            AttributeKind::Bool => Extractor::Bool(name),
            AttributeKind::Int => Extractor::Int(name),
            AttributeKind::Float => Extractor::Float(name),
            AttributeKind::Str => Extractor::Str(name),
            AttributeKind::Time => Extractor::Time(name),
        }
    }
}

/// Pulls one typed attribute out of a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Extractor {
    Bool(Arc<str>),
    Int(Arc<str>),
    Float(Arc<str>),
    Str(Arc<str>),
    Time(Arc<str>),
}

impl Extractor {
    pub fn attribute(&self) -> &str {
        match self {
            Extractor::Bool(n)
            | Extractor::Int(n)
            | Extractor::Float(n)
            | Extractor::Str(n)
            | Extractor::Time(n) => n,
        }
    }

    pub fn kind(&self) -> AttributeKind {
        match self {
            Extractor::Bool(_) => AttributeKind::Bool,
            Extractor::Int(_) => AttributeKind::Int,
            Extractor::Float(_) => AttributeKind::Float,
            Extractor::Str(_) => AttributeKind::Str,
            Extractor::Time(_) => AttributeKind::Time,
        }
    }

    /// The attribute value; a missing attribute reads as null, a value of the
    /// wrong type is an error
    pub fn extract_value(&self, snapshot: &Snapshot) -> Result<Value> {
        let value = snapshot.attribute(self.attribute()).cloned().unwrap_or(Value::Null);
        if self.kind().accepts(&value) {
            Ok(value)
        } else {
            Err(Error::AttributeMismatch {
                identity: snapshot.identity().to_string(),
                attribute: self.attribute().to_string(),
            })
        }
    }

    /// Order two snapshots on this attribute
    pub fn compare_value(&self, a: &Snapshot, b: &Snapshot) -> Ordering {
        let left = a.attribute(self.attribute()).unwrap_or(&Value::Null);
        let right = b.attribute(self.attribute()).unwrap_or(&Value::Null);
        left.compare_value(right)
    }

    /// Hash of this attribute on the snapshot
    pub fn hash_value(&self, snapshot: &Snapshot) -> u64 {
        snapshot
            .attribute(self.attribute())
            .map(Value::hash_value)
            .unwrap_or(0)
    }
}

/// Build the composite key of `snapshot` over `extractors`
pub fn extract_key(extractors: &[Extractor], snapshot: &Snapshot) -> Result<super::IndexKey> {
    let values = extractors
        .iter()
        .map(|e| e.extract_value(snapshot))
        .collect::<Result<Vec<_>>>()?;
    Ok(super::IndexKey::new(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temporal::Rectangle;

    fn snapshot() -> Snapshot {
        Snapshot::builder(vec![Value::Int(1)])
            .attribute("id", 1)
            .attribute("name", "moh")
            .attribute("active", true)
            .rectangle(Rectangle::full())
            .build()
            .unwrap()
    }

    #[test]
    fn test_extract_value() {
        let s = snapshot();
        let name = Attribute::new("name", AttributeKind::Str).extractor();
        assert_eq!(name.extract_value(&s).unwrap(), Value::from("moh"));

        let missing = Attribute::new("desc", AttributeKind::Str).extractor();
        assert_eq!(missing.extract_value(&s).unwrap(), Value::Null);
    }

    #[test]
    fn test_extract_wrong_type_fails() {
        let s = snapshot();
        let wrong = Extractor::Int(Arc::from("name"));
        assert!(matches!(
            wrong.extract_value(&s),
            Err(Error::AttributeMismatch { .. })
        ));
    }

    #[test]
    fn test_coerce_json() {
        let json = serde_json::json!("2002-01-02");
        let v = AttributeKind::Time.coerce(&json).unwrap();
        assert_eq!(v.as_time(), Some(Timestamp::parse("2002-01-02").unwrap()));
        assert!(AttributeKind::Int.coerce(&serde_json::json!("12")).is_none());
        assert_eq!(
            AttributeKind::Int.coerce(&serde_json::Value::Null),
            Some(Value::Null)
        );
    }

    #[test]
    fn test_compare_and_hash() {
        let a = snapshot();
        let b = Snapshot::builder(vec![Value::Int(2)])
            .attribute("id", 2)
            .attribute("name", "zed")
            .build()
            .unwrap();
        let name = Extractor::Str(Arc::from("name"));
        assert_eq!(name.compare_value(&a, &b), Ordering::Less);
        assert_eq!(name.hash_value(&a), Value::from("moh").hash_value());
    }
}
