//! Dated Cache Engine
//!
//! A [`DatedCache`] holds every version of one entity type: full caches are
//! bulk loaded up front, partial caches fill per identity on a miss. All
//! writes go through [`mutation::apply`] and are published one identity
//! chain at a time.

mod config;
mod dated;
mod locks;
mod metrics;
pub mod mutation;
mod relationship;
mod source;

pub use config::{CacheConfig, CacheMode};
pub use dated::DatedCache;
pub use locks::{KeyLockTable, StripeGuards};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use mutation::{Changes, Mutation};
pub use relationship::RelationshipTable;
pub use source::{DataSource, VecSource};
