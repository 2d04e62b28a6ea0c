//! Typed attribute values and composite index keys
//!
//! Keys carry a precomputed hash so shard routing and bucket lookups never
//! rehash the attribute tuple; equality compares hashes first and falls back
//! to a full comparison for collision resolution.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::temporal::Timestamp;

/// A single attribute value
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Time(Timestamp),
}

impl Value {
    /// Fast non-cryptographic hash (FxHash algorithm)
    #[inline]
    pub(crate) fn fx_hash(bytes: &[u8]) -> u64 {
        const SEED: u64 = 0x517cc1b727220a95;
        let mut hash = SEED;
        for &byte in bytes {
            hash = hash.rotate_left(5) ^ (byte as u64);
            hash = hash.wrapping_mul(SEED);
        }
        hash
    }

    /// Stable hash of the value, tagged by type so `Int(1)` and `Bool(true)`
    /// land in different buckets
    pub fn hash_value(&self) -> u64 {
        match self {
            Value::Null => 0,
            Value::Bool(b) => Self::fx_hash(&[1, *b as u8]),
            Value::Int(i) => Self::fx_hash(&i.to_le_bytes()) ^ 2,
            Value::Float(f) => Self::fx_hash(&normalize_float(*f).to_le_bytes()) ^ 3,
            Value::Str(s) => Self::fx_hash(s.as_bytes()) ^ 4,
            Value::Time(t) => Self::fx_hash(&t.as_millis().to_le_bytes()) ^ 5,
        }
    }

    /// Total order; nulls sort first, mismatched types order by type tag
    pub fn compare_value(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Time(a), Value::Time(b)) => a.cmp(b),
            _ => self.tag().cmp(&other.tag()),
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::Str(_) => 4,
            Value::Time(_) => 5,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<Timestamp> {
        match self {
            Value::Time(t) => Some(*t),
            _ => None,
        }
    }
}

fn normalize_float(f: f64) -> u64 {
    if f == 0.0 {
        0
    } else if f.is_nan() {
        f64::NAN.to_bits()
    } else {
        f.to_bits()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => normalize_float(*a) == normalize_float(*b),
            _ => self.compare_value(other) == Ordering::Equal,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash_value().hash(state);
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Time(t) => write!(f, "{}", t),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(Arc::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(Arc::from(v))
    }
}

impl From<Arc<str>> for Value {
    fn from(v: Arc<str>) -> Self {
        Value::Str(v)
    }
}

impl From<Timestamp> for Value {
    fn from(v: Timestamp) -> Self {
        Value::Time(v)
    }
}

// =============================================================================
// Index Key
// =============================================================================

/// Composite key extracted from a snapshot; a snapshot's identity is the
/// index key over its primary-key attributes.
#[derive(Clone, Debug, Eq)]
pub struct IndexKey {
    /// Combined hash of the values
    hash: u64,
    /// The attribute values in extractor order
    values: Arc<[Value]>,
}

/// The business identity of an entity
pub type Identity = IndexKey;

impl IndexKey {
    pub fn new(values: Vec<Value>) -> Self {
        let hash = values
            .iter()
            .fold(0xcbf29ce484222325u64, |acc, v| {
                acc.rotate_left(5) ^ v.hash_value()
            })
            .wrapping_mul(0x100000001b3);
        Self {
            hash,
            values: values.into(),
        }
    }

    /// Single-attribute key
    pub fn single(value: impl Into<Value>) -> Self {
        Self::new(vec![value.into()])
    }

    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Precomputed hash for shard routing
    #[inline]
    pub fn combined_hash(&self) -> u64 {
        self.hash
    }

    /// Bucket index in `0..buckets` (buckets must be a power of two)
    #[inline]
    pub fn shard_index(&self, buckets: usize) -> usize {
        (self.hash as usize) & (buckets - 1)
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        // Fast path: compare hashes first
        if self.hash != other.hash {
            return false;
        }
        // Slow path: full comparison for collision resolution
        self.values == other.values
    }
}

impl Hash for IndexKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.values.iter().zip(other.values.iter()) {
            let ord = a.compare_value(b);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.values.len().cmp(&other.values.len())
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_value_equality_and_hash() {
        assert_eq!(Value::from(1), Value::Int(1));
        assert_ne!(Value::Int(1), Value::Bool(true));
        assert_ne!(Value::Int(1).hash_value(), Value::Bool(true).hash_value());
        assert_eq!(Value::Float(0.0), Value::Float(-0.0));
        assert_eq!(Value::Float(0.0).hash_value(), Value::Float(-0.0).hash_value());
    }

    #[test]
    fn test_value_ordering() {
        assert_eq!(Value::Null.compare_value(&Value::Int(0)), Ordering::Less);
        assert_eq!(Value::from("a").compare_value(&Value::from("b")), Ordering::Less);
        assert_eq!(Value::Int(5).compare_value(&Value::Int(5)), Ordering::Equal);
    }

    #[test]
    fn test_index_key_equality() {
        let a = IndexKey::new(vec![Value::Int(1), Value::from("abc")]);
        let b = IndexKey::new(vec![Value::Int(1), Value::from("abc")]);
        let c = IndexKey::new(vec![Value::Int(1), Value::from("abd")]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.combined_hash(), b.combined_hash());

        let set: HashSet<IndexKey> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&a));
    }

    #[test]
    fn test_index_key_display() {
        let key = IndexKey::new(vec![Value::Int(3), Value::from("x"), Value::Null]);
        assert_eq!(key.to_string(), "[3, \"x\", null]");
    }

    #[test]
    fn test_shard_index_in_range() {
        for i in 0..1000 {
            let key = IndexKey::single(i as i64);
            assert!(key.shard_index(16) < 16);
        }
    }
}
