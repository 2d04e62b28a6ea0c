//! Write executor configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default worker threads
pub const DEFAULT_WORKERS: usize = 4;

/// Default tasks per batch
pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Worker threads, each with its own queue
    pub workers: usize,
    /// Tasks handed to the sink per batch
    pub batch_size: usize,
    /// Consecutive attempts before a task is requeued
    pub max_retries: u32,
    /// Times a task may go to the back of its queue before it is failed
    pub max_requeues: u32,
    /// Idle time after which a partial batch is flushed
    pub flush_interval_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: 3,
            max_requeues: 2,
            flush_interval_ms: 50,
        }
    }
}

impl ExecutorConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be > 0".into()));
        }
        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be > 0".into()));
        }
        if self.flush_interval_ms == 0 {
            return Err(Error::Config("flush_interval_ms must be > 0".into()));
        }
        Ok(())
    }
}
