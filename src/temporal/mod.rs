//! Temporal Key Model
//!
//! Timestamps, half-open intervals and the 2-D milestoning rectangle that
//! every snapshot occupies.
//!
//! ```text
//!  processing
//!      ▲
//!  INF ┤      ┌───────────────┐   open version (processing to = INFINITY)
//!      │      │   current     │
//!   t1 ┤──────┼───────────────┤   milestoned at t1
//!      │      │   closed      │
//!   t0 ┤      └───────────────┘
//!      └──────┴───────────────┴──▶ business
//!            b0              INF
//! ```
//!
//! Two snapshots of the same identity must never share any point of this
//! plane; [`Rectangle::overlaps`] is the check used by the unique indices
//! and by the overlap scan.

mod interval;
mod rectangle;
mod timestamp;

pub use interval::Interval;
pub use rectangle::Rectangle;
pub use timestamp::Timestamp;

// =============================================================================
// Tests
// =============================================================================
