//! Transaction options and outcomes.

use std::time::Duration;

use tabula_core::{IsolationLevel, StorageError, TabulaError, TabulaResult, TransactionConfig};

/// Bounds for a single `execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Maximum time to wait for a transaction slot.
    pub max_wait: Duration,
    /// Maximum time the transaction body may run.
    pub timeout: Duration,
    pub isolation_level: IsolationLevel,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self::from(&TransactionConfig::default())
    }
}

impl From<&TransactionConfig> for TransactionOptions {
    fn from(config: &TransactionConfig) -> Self {
        Self {
            max_wait: config.max_wait,
            timeout: config.timeout,
            isolation_level: config.isolation_level,
        }
    }
}

impl TransactionOptions {
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }
}

/// Outcome of one transaction.
///
/// On failure the transaction has already been rolled back; `rollback_reason`
/// describes why and should be logged or shown to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<TabulaError>,
    pub rollback_reason: Option<String>,
}

impl<T> TransactionResult<T> {
    pub fn committed(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            rollback_reason: None,
        }
    }

    pub fn rolled_back(error: TabulaError, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            rollback_reason: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    /// True if the failure may succeed when run again.
    pub fn is_retryable(&self) -> bool {
        self.error.as_ref().is_some_and(TabulaError::is_retryable)
    }

    pub fn map<U, F>(self, f: F) -> TransactionResult<U>
    where
        F: FnOnce(T) -> U,
    {
        TransactionResult {
            success: self.success,
            data: self.data.map(f),
            error: self.error,
            rollback_reason: self.rollback_reason,
        }
    }

    /// Convert into a plain `Result`, discarding the rollback reason.
    pub fn into_result(self) -> TabulaResult<T> {
        match (self.success, self.data, self.error) {
            (true, Some(data), _) => Ok(data),
            (_, _, Some(error)) => Err(error),
            _ => Err(StorageError::Backend {
                code: "XX000".to_string(),
                message: self
                    .rollback_reason
                    .unwrap_or_else(|| "transaction produced no result".to_string()),
            }
            .into()),
        }
    }
}
