//! Transaction style

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Timeout and retry policy of a unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionStyle {
    /// Wall-clock budget of one attempt, including the commit lock wait
    pub timeout_ms: u64,
    /// Re-executions allowed after the first attempt
    pub max_retries: u32,
    /// Whether lock timeouts and deadlocks are retried
    pub retry_on_timeout: bool,
}

impl Default for TransactionStyle {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            max_retries: 10,
            retry_on_timeout: true,
        }
    }
}

impl TransactionStyle {
    pub fn new(timeout: Duration, max_retries: u32, retry_on_timeout: bool) -> Self {
        Self {
            timeout_ms: timeout.as_millis().min(u64::MAX as u128) as u64,
            max_retries,
            retry_on_timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub fn with_retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::Config("transaction timeout must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let style = TransactionStyle::default()
            .with_max_retries(5)
            .with_timeout(Duration::from_secs(2))
            .with_retry_on_timeout(false);
        assert_eq!(style.max_retries, 5);
        assert_eq!(style.timeout(), Duration::from_secs(2));
        assert!(!style.retry_on_timeout);
        assert!(style.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_invalid() {
        let style = TransactionStyle::new(Duration::ZERO, 1, true);
        assert!(style.validate().is_err());
    }

    #[test]
    fn test_from_json() {
        let style: TransactionStyle = serde_json::from_str(r#"{"max_retries": 3}"#).unwrap();
        assert_eq!(style.max_retries, 3);
        assert_eq!(style.timeout_ms, 60_000);
    }
}
