//! Entity Model
//!
//! Typed attribute values, the closed set of attribute extractors, entity
//! snapshots and the descriptors that configure an entity type.

mod attribute;
mod descriptor;
mod snapshot;
mod value;

pub use attribute::{extract_key, Attribute, AttributeKind, Extractor};
pub use descriptor::{
    value_to_json, AsOfAttribute, EntityDescriptor, IndexKind, IndexSpec, Row, PRIMARY_INDEX,
};
pub use snapshot::{OverlapPair, OverlapRecord, Snapshot, SnapshotBuilder};
pub use value::{Identity, IndexKey, Value};
