//! Transaction Coordinator
//!
//! ```text
//!   execute(work) ──► begin ──► work(tx) ──► Done ──► commit ──► Ok
//!                       ▲          │                    │
//!                       │          ├─ Retry ────────────┤
//!                       │          └─ Err ──────────────┤
//!                       │                               ▼
//!                       └──── retriable && budget ◄── rollback
//! ```

mod coordinator;
mod style;
mod transaction;

pub use coordinator::{Attempt, TransactionCoordinator};
pub use style::TransactionStyle;
pub use transaction::{Transaction, TransactionState};
