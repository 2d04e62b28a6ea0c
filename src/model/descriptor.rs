//! Entity descriptors
//!
//! The descriptor is the explicit configuration of one entity type: its
//! attributes, primary key, the attributes holding the business and
//! processing intervals, which attributes are immutable, and the secondary
//! indices the cache should maintain. Descriptors load from YAML or JSON.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::attribute::{Attribute, AttributeKind, Extractor};
use super::snapshot::Snapshot;
use super::value::{IndexKey, Value};
use crate::error::{Error, Result};
use crate::temporal::{Interval, Rectangle, Timestamp};

/// A raw row as delivered by a data source
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Name reserved for the primary (identity) index
pub const PRIMARY_INDEX: &str = "primary";

/// Attribute pair holding one interval axis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsOfAttribute {
    /// Attribute holding the inclusive start
    pub from: String,
    /// Attribute holding the exclusive end; absent or null reads as infinity
    pub to: String,
}

/// Secondary index kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// One snapshot per key; only allowed for non-dated entities
    Unique,
    /// Many snapshots per key
    NonUnique,
}

/// Secondary index definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub attributes: Vec<String>,
    pub kind: IndexKind,
}

/// Configuration of one entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    /// Entity name, used in logs and metric labels
    pub name: String,
    /// All attributes, including the primary key
    pub attributes: Vec<Attribute>,
    /// Primary-key attribute names, in key order
    pub primary_key: Vec<String>,
    /// Business-date axis, if the entity is business dated
    #[serde(default)]
    pub business_date: Option<AsOfAttribute>,
    /// Processing-date axis, if the entity is audited
    #[serde(default)]
    pub processing_date: Option<AsOfAttribute>,
    /// Attributes an update may not change
    #[serde(default)]
    pub immutable: Vec<String>,
    /// Secondary indices
    #[serde(default)]
    pub indices: Vec<IndexSpec>,
}

impl EntityDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            primary_key: Vec::new(),
            business_date: None,
            processing_date: None,
            immutable: Vec::new(),
            indices: Vec::new(),
        }
    }

    pub fn attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn primary_key<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.primary_key = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn business_dated(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.business_date = Some(AsOfAttribute {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    pub fn processing_dated(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.processing_date = Some(AsOfAttribute {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    pub fn immutable<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.immutable = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn index<S: Into<String>>(
        mut self,
        name: impl Into<String>,
        attributes: impl IntoIterator<Item = S>,
        kind: IndexKind,
    ) -> Self {
        self.indices.push(IndexSpec {
            name: name.into(),
            attributes: attributes.into_iter().map(Into::into).collect(),
            kind,
        });
        self
    }

    /// Parse from YAML text
    pub fn from_yaml(text: &str) -> Result<Self> {
        let descriptor: Self = serde_yaml::from_str(text)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Parse from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        let descriptor: Self = serde_json::from_str(text)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Load from a file; `.json` is parsed as JSON, anything else as YAML
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text),
            _ => Self::from_yaml(&text),
        }
    }

    /// Validate the descriptor
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("entity name must not be empty".into()));
        }
        if self.primary_key.is_empty() {
            return Err(Error::Config(format!(
                "entity {} has no primary key",
                self.name
            )));
        }

        let mut names = HashSet::new();
        for attribute in &self.attributes {
            if !names.insert(attribute.name.as_str()) {
                return Err(Error::Config(format!(
                    "entity {} declares attribute '{}' twice",
                    self.name, attribute.name
                )));
            }
        }

        let referenced = self
            .primary_key
            .iter()
            .chain(self.immutable.iter())
            .chain(self.indices.iter().flat_map(|i| i.attributes.iter()));
        for name in referenced {
            if !names.contains(name.as_str()) {
                return Err(Error::Config(format!(
                    "entity {} references undeclared attribute '{}'",
                    self.name, name
                )));
            }
        }
        for name in &self.primary_key {
            if self.find_attribute(name).is_some_and(|a| a.nullable) {
                return Err(Error::Config(format!(
                    "primary key attribute '{}' of {} cannot be nullable",
                    name, self.name
                )));
            }
        }

        for axis in [&self.business_date, &self.processing_date].into_iter().flatten() {
            for name in [&axis.from, &axis.to] {
                if names.contains(name.as_str()) {
                    return Err(Error::Config(format!(
                        "as-of attribute '{}' of {} clashes with a payload attribute",
                        name, self.name
                    )));
                }
            }
        }

        let mut index_names = HashSet::new();
        for index in &self.indices {
            if index.name == PRIMARY_INDEX || !index_names.insert(index.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate index name '{}' on {}",
                    index.name, self.name
                )));
            }
            if index.attributes.is_empty() {
                return Err(Error::Config(format!(
                    "index '{}' on {} has no attributes",
                    index.name, self.name
                )));
            }
            if index.kind == IndexKind::Unique && self.is_dated() {
                return Err(Error::Config(format!(
                    "unique index '{}' requires {} to be non-dated",
                    index.name, self.name
                )));
            }
        }
        Ok(())
    }

    pub fn is_business_dated(&self) -> bool {
        self.business_date.is_some()
    }

    pub fn is_processing_dated(&self) -> bool {
        self.processing_date.is_some()
    }

    pub fn is_dated(&self) -> bool {
        self.is_business_dated() || self.is_processing_dated()
    }

    pub fn find_attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn is_immutable(&self, name: &str) -> bool {
        self.immutable.iter().any(|n| n == name) || self.primary_key.iter().any(|n| n == name)
    }

    /// Extractors over the given attribute names
    pub fn extractors_for(&self, names: &[String]) -> Result<Vec<Extractor>> {
        names
            .iter()
            .map(|name| {
                self.find_attribute(name)
                    .map(Attribute::extractor)
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "entity {} has no attribute '{}'",
                            self.name, name
                        ))
                    })
            })
            .collect()
    }

    /// Extractors over the primary key
    pub fn identity_extractors(&self) -> Result<Vec<Extractor>> {
        self.extractors_for(&self.primary_key)
    }

    // =========================================================================
    // Row Conversion
    // =========================================================================

    /// Identity of a raw row
    pub fn identity_from_row(&self, row: &Row) -> Result<IndexKey> {
        let values = self
            .primary_key
            .iter()
            .map(|name| {
                let attribute = self.find_attribute(name).ok_or_else(|| {
                    Error::Config(format!("entity {} has no attribute '{}'", self.name, name))
                })?;
                let value = self.coerce(attribute, row)?;
                if value.is_null() {
                    return Err(Error::DataSource(format!(
                        "primary key '{}' of {} is null",
                        name, self.name
                    )));
                }
                Ok(value)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(IndexKey::new(values))
    }

    /// Build a snapshot from a raw row
    pub fn snapshot_from_row(&self, row: &Row) -> Result<Snapshot> {
        let identity = self.identity_from_row(row)?;
        let mut builder = Snapshot::builder(identity.values().to_vec());
        for attribute in &self.attributes {
            let value = self.coerce(attribute, row)?;
            if value.is_null() && !attribute.nullable {
                return Err(Error::DataSource(format!(
                    "attribute '{}' of {} {} is null",
                    attribute.name, self.name, identity
                )));
            }
            builder = builder.attribute(attribute.name.clone(), value);
        }
        let rectangle = Rectangle::new(
            self.interval_from_row(self.business_date.as_ref(), row, "business")?,
            self.interval_from_row(self.processing_date.as_ref(), row, "processing")?,
        );
        builder.rectangle(rectangle).build()
    }

    /// Convert a snapshot back to a row, including its as-of attributes
    pub fn snapshot_to_row(&self, snapshot: &Snapshot) -> Row {
        let mut row = Row::new();
        for (name, value) in snapshot.attributes() {
            row.insert(name.clone(), value_to_json(value));
        }
        if let Some(axis) = &self.business_date {
            insert_interval(&mut row, axis, snapshot.business());
        }
        if let Some(axis) = &self.processing_date {
            insert_interval(&mut row, axis, snapshot.processing());
        }
        row
    }

    fn coerce(&self, attribute: &Attribute, row: &Row) -> Result<Value> {
        let raw = row.get(&attribute.name).unwrap_or(&serde_json::Value::Null);
        attribute.kind.coerce(raw).ok_or_else(|| {
            Error::DataSource(format!(
                "attribute '{}' of {} is not a {:?}: {}",
                attribute.name, self.name, attribute.kind, raw
            ))
        })
    }

    fn interval_from_row(
        &self,
        axis: Option<&AsOfAttribute>,
        row: &Row,
        label: &'static str,
    ) -> Result<Interval> {
        let Some(axis) = axis else {
            return Ok(Interval::full());
        };
        let raw_from = row.get(&axis.from).unwrap_or(&serde_json::Value::Null);
        let from = match AttributeKind::Time.coerce(raw_from) {
            Some(Value::Time(t)) => t,
            _ => {
                return Err(Error::DataSource(format!(
                    "{} start '{}' of {} is missing or malformed",
                    label, axis.from, self.name
                )))
            }
        };
        let to = match row.get(&axis.to) {
            None | Some(serde_json::Value::Null) => Timestamp::INFINITY,
            Some(raw) => match AttributeKind::Time.coerce(raw) {
                Some(Value::Time(t)) => t,
                _ => {
                    return Err(Error::DataSource(format!(
                        "{} end '{}' of {} is malformed: {}",
                        label, axis.to, self.name, raw
                    )))
                }
            },
        };
        if from > to {
            return Err(Error::InvalidInterval {
                axis: label,
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        Interval::new(from, to)
    }
}

fn insert_interval(row: &mut Row, axis: &AsOfAttribute, interval: &Interval) {
    row.insert(axis.from.clone(), interval.from().to_string().into());
    row.insert(axis.to.clone(), interval.to().to_string().into());
}

/// JSON form of a value
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => (*b).into(),
        Value::Int(i) => (*i).into(),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Str(s) => s.to_string().into(),
        Value::Time(t) => t.to_string().into(),
    }
}
