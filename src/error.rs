//! Error types for the bitemporal cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Why a transient failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    /// A per-key lock could not be acquired within the transaction timeout
    LockTimeout,
    /// Two writers raced on the same identity; the loser saw a stale version
    OptimisticConflict,
    /// A lower layer reported a deadlock victim
    Deadlock,
}

impl std::fmt::Display for TransientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransientKind::LockTimeout => write!(f, "lock timeout"),
            TransientKind::OptimisticConflict => write!(f, "optimistic conflict"),
            TransientKind::Deadlock => write!(f, "deadlock"),
        }
    }
}

/// Errors that can occur in the cache, transaction and queue layers
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Temporal Model Errors
    // =========================================================================
    /// Zero-length interval; fatal, never retried
    #[error("Degenerate {axis} interval [{from}, {to}) for {identity}")]
    DegenerateInterval {
        identity: String,
        axis: &'static str,
        from: String,
        to: String,
    },

    /// Interval whose start lies after its end
    #[error("Invalid {axis} interval: from {from} is after to {to}")]
    InvalidInterval {
        axis: &'static str,
        from: String,
        to: String,
    },

    /// Timestamp text could not be parsed
    #[error("Failed to parse timestamp: {0}")]
    TimestampParse(String),

    // =========================================================================
    // Index Errors
    // =========================================================================
    /// Unique index collision with an overlapping rectangle
    #[error("Duplicate key {key} in index {index}: {existing} overlaps {incoming}")]
    DuplicateKey {
        index: String,
        key: String,
        existing: String,
        incoming: String,
    },

    /// Point query matched more than one snapshot
    #[error("Ambiguous result for {identity}: {matches} snapshots match the as-of point")]
    AmbiguousResult { identity: String, matches: usize },

    /// Index reference used against the wrong cache or with an invalid slot
    #[error("Stale index reference (cache {cache_id}, slot {slot}): {reason}")]
    StaleReference {
        cache_id: u64,
        slot: i32,
        reason: String,
    },

    /// Snapshot does not carry an attribute an index or extractor needs
    #[error("Attribute '{attribute}' missing or of wrong type on {identity}")]
    AttributeMismatch { identity: String, attribute: String },

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// Mutation targeted an identity with no open snapshot
    #[error("No open snapshot for identity {0}")]
    UnknownIdentity(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upstream data source failure
    #[error("Data source error: {0}")]
    DataSource(String),

    // =========================================================================
    // Transaction Errors
    // =========================================================================
    /// Retriable resource contention (lock timeout, deadlock, stale version)
    #[error("Retriable transient failure ({kind}): {reason}")]
    RetriableTransient { kind: TransientKind, reason: String },

    /// A unit of work asked to be re-executed
    #[error("Retry requested: {0}")]
    RetryRequested(String),

    /// Business failure; aborts and rolls back the transaction
    #[error("Business error: {0}")]
    NonRetriableBusiness(String),

    /// Illegal transaction state transition
    #[error("Transaction {id} is {state}, cannot {operation}")]
    TransactionState {
        id: String,
        state: String,
        operation: &'static str,
    },

    /// Retries exhausted; wraps the last retriable failure
    #[error("Transaction gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<Error> },

    // =========================================================================
    // Write Queue Errors
    // =========================================================================
    /// One or more queued tasks exhausted their retries
    #[error("{failed} queued task(s) failed; first failure: {first}")]
    QueueTasksFailed { failed: usize, first: String },

    /// Executor has been shut down
    #[error("Write executor is shut down")]
    ExecutorShutdown,

    // =========================================================================
    // I/O and Serialization Errors
    // =========================================================================
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a transaction may re-execute its unit of work after this error
    /// given the `retry_on_timeout` flag of its style.
    pub fn is_retriable(&self, retry_on_timeout: bool) -> bool {
        match self {
            Error::RetryRequested(_) => true,
            Error::RetriableTransient { kind, .. } => match kind {
                TransientKind::OptimisticConflict => true,
                TransientKind::LockTimeout | TransientKind::Deadlock => retry_on_timeout,
            },
            _ => false,
        }
    }

    /// Shorthand for a lock timeout
    pub fn lock_timeout(reason: impl Into<String>) -> Self {
        Error::RetriableTransient {
            kind: TransientKind::LockTimeout,
            reason: reason.into(),
        }
    }

    /// Shorthand for an optimistic conflict
    pub fn conflict(reason: impl Into<String>) -> Self {
        Error::RetriableTransient {
            kind: TransientKind::OptimisticConflict,
            reason: reason.into(),
        }
    }
}
