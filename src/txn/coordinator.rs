//! Retrying unit-of-work runner

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::style::TransactionStyle;
use super::transaction::Transaction;
use crate::cache::DatedCache;
use crate::error::{Error, Result};

/// Outcome of one execution of a unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    /// Commit and hand the value back
    Done(T),
    /// Discard this attempt and run the work again
    Retry { reason: String },
}

impl<T> Attempt<T> {
    pub fn retry(reason: impl Into<String>) -> Self {
        Attempt::Retry {
            reason: reason.into(),
        }
    }
}

/// Runs units of work against one cache, re-executing them on retriable
/// failures up to the style's retry budget
#[derive(Debug, Clone)]
pub struct TransactionCoordinator {
    cache: Arc<DatedCache>,
    style: TransactionStyle,
}

impl TransactionCoordinator {
    pub fn new(cache: Arc<DatedCache>, style: TransactionStyle) -> Result<Self> {
        style.validate()?;
        Ok(Self { cache, style })
    }

    pub fn cache(&self) -> &Arc<DatedCache> {
        &self.cache
    }

    pub fn style(&self) -> &TransactionStyle {
        &self.style
    }

    /// Start a transaction the caller drives by hand
    pub fn begin(&self) -> Transaction<'_> {
        Transaction::begin(&self.cache, self.style)
    }

    /// Execute with the coordinator's default style
    pub fn execute<T, F>(&self, work: F) -> Result<T>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<Attempt<T>>,
    {
        self.execute_with_style(self.style, work)
    }

    /// Execute `work` in a fresh transaction per attempt. Every attempt that
    /// does not commit is rolled back before the next one starts.
    #[instrument(skip(self, work), fields(entity = %self.cache.descriptor().name))]
    pub fn execute_with_style<T, F>(&self, style: TransactionStyle, mut work: F) -> Result<T>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<Attempt<T>>,
    {
        style.validate()?;
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let mut tx = Transaction::begin(&self.cache, style);
            let failure = match work(&mut tx) {
                Ok(Attempt::Done(value)) => match tx.commit() {
                    Ok(()) => {
                        if attempts > 1 {
                            info!(tx = %tx.id(), attempts, "Transaction committed after retry");
                        }
                        return Ok(value);
                    }
                    Err(e) => e,
                },
                Ok(Attempt::Retry { reason }) => {
                    tx.rollback()?;
                    Error::RetryRequested(reason)
                }
                Err(e) => {
                    tx.rollback()?;
                    e
                }
            };

            if !failure.is_retriable(style.retry_on_timeout) {
                debug!(tx = %tx.id(), error = %failure, "Transaction aborted");
                return Err(failure);
            }
            if attempts > style.max_retries {
                warn!(attempts, error = %failure, "Transaction retries exhausted");
                return Err(Error::RetriesExhausted {
                    attempts,
                    last: Box::new(failure),
                });
            }
            self.cache.metrics().record_retry();
            warn!(tx = %tx.id(), attempt = attempts, error = %failure, "Retrying transaction");
            std::thread::yield_now();
        }
    }
}
