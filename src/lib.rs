//! Bitemporal Cache - In-memory milestoned object cache
//!
//! Stores immutable snapshots of entities keyed by business identity plus two
//! independent time axes (business date and processing date), answers
//! point-in-time and range queries, reports overlapping milestoning, and
//! applies writes through retrying transactions or a queued multi-worker
//! executor.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  MultiQueueExecutor ──► TransactionCoordinator ──► DatedCache    │
//! │     (queue)                  (txn)                  (cache)      │
//! │                                                        │         │
//! │                          ┌─────────────────────────────┤         │
//! │                          ▼                             ▼         │
//! │                    Index Layer                  Data Source      │
//! │                      (index)                                     │
//! │                          │                                       │
//! │                          ▼                                       │
//! │          Model (model) + Temporal Key Model (temporal)           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`temporal`] - Timestamps, intervals and milestoning rectangles
//! - [`model`] - Values, attributes, snapshots and entity descriptors
//! - [`index`] - Sharded concurrent indices and the string index
//! - [`cache`] - Dated cache engine, mutations, metrics and data sources
//! - [`txn`] - Transactions and the retrying coordinator
//! - [`queue`] - Queued multi-worker write executor
//! - [`error`] - Error types

pub mod cache;
pub mod error;
pub mod index;
pub mod model;
pub mod queue;
pub mod temporal;
pub mod txn;

// Re-export commonly used types
pub use cache::{CacheConfig, CacheMode, DatedCache, DataSource, Mutation, VecSource};
pub use error::{Error, Result};
pub use index::IndexReference;
pub use model::{EntityDescriptor, IndexKey, OverlapRecord, Snapshot, Value};
pub use queue::{ExecutorConfig, MultiQueueExecutor};
pub use temporal::{Interval, Rectangle, Timestamp};
pub use txn::{Attempt, TransactionCoordinator, TransactionStyle};
