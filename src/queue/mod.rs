//! Queued Write Executor
//!
//! Writes are routed to a fixed set of worker threads by identity hash,
//! batched per worker and handed to a [`WriteSink`].

mod config;
mod executor;
mod sink;

pub use config::{ExecutorConfig, DEFAULT_BATCH_SIZE, DEFAULT_WORKERS};
pub use executor::{ExecutorReport, MultiQueueExecutor, TaskFailure};
pub use sink::{CacheWriteSink, WriteSink};
