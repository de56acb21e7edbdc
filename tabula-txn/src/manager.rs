//! Transaction execution and retry.

use std::future::Future;
use std::sync::Arc;

use tabula_core::{
    RetryConfig, TabulaConfig, TabulaError, TabulaResult, TimeoutError, TransactionConfig,
};
use tabula_storage::{CacheLayer, RelationalStore, StoreTransaction};
use tokio::time::{sleep, timeout};

use crate::result::{TransactionOptions, TransactionResult};

/// Runs closures against a store transaction so that they either commit as a
/// whole or leave no trace.
///
/// The manager adds no locking of its own; isolation between concurrent
/// callers is whatever the requested isolation level gives.
pub struct TransactionManager<S: RelationalStore> {
    store: Arc<S>,
    cache: Option<Arc<CacheLayer>>,
    config: TransactionConfig,
    retry: RetryConfig,
}

impl<S: RelationalStore> TransactionManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            cache: None,
            config: TransactionConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    /// Build a manager from the workspace configuration.
    pub fn from_config(store: Arc<S>, cache: Option<Arc<CacheLayer>>, config: &TabulaConfig) -> Self {
        Self {
            store,
            cache,
            config: config.transaction.clone(),
            retry: config.retry.clone(),
        }
    }

    /// Invalidate entries of `cache` after successful cascading writes.
    pub fn with_cache(mut self, cache: Arc<CacheLayer>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_config(mut self, config: TransactionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn cache(&self) -> Option<&Arc<CacheLayer>> {
        self.cache.as_ref()
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Options derived from the manager's configuration.
    pub fn default_options(&self) -> TransactionOptions {
        TransactionOptions::from(&self.config)
    }

    /// Run `ops` inside one transaction.
    ///
    /// Waits at most `max_wait` for a transaction and lets `ops` run for at
    /// most `timeout`. If `ops` fails or times out, everything it wrote is
    /// rolled back. Failures are reported in the result, never returned as
    /// `Err`.
    pub async fn execute<T, F, Fut>(&self, ops: F, options: &TransactionOptions) -> TransactionResult<T>
    where
        F: FnOnce(S::Tx) -> Fut,
        Fut: Future<Output = TabulaResult<T>>,
    {
        let tx = match timeout(options.max_wait, self.store.begin(options.isolation_level)).await {
            Ok(Ok(tx)) => tx,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to begin transaction");
                let reason = format!("Transaction could not be started: {}", e);
                return TransactionResult::rolled_back(e, reason);
            }
            Err(_) => {
                let e: TabulaError = TimeoutError::AcquireTransaction {
                    waited: options.max_wait,
                }
                .into();
                tracing::warn!(max_wait_ms = options.max_wait.as_millis() as u64, "Timed out waiting for a transaction");
                let reason = format!("Transaction could not be started: {}", e);
                return TransactionResult::rolled_back(e, reason);
            }
        };
        tracing::debug!(isolation = %options.isolation_level, "Transaction started");

        let outcome = match timeout(options.timeout, ops(tx.clone())).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TimeoutError::TransactionBody {
                limit: options.timeout,
            }
            .into()),
        };

        match outcome {
            Ok(data) => match tx.commit().await {
                Ok(()) => {
                    tracing::debug!("Transaction committed");
                    TransactionResult::committed(data)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Commit failed, transaction rolled back");
                    let reason = format!("Commit failed: {}", e);
                    TransactionResult::rolled_back(e, reason)
                }
            },
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "Rollback failed");
                }
                tracing::warn!(error = %e, "Transaction rolled back");
                let reason = format!("Transaction rolled back: {}", e);
                TransactionResult::rolled_back(e, reason)
            }
        }
    }

    /// Run `ops` with [`execute`](Self::execute), repeating it after
    /// retryable failures.
    ///
    /// `max_retries` bounds the total number of attempts. Attempts are
    /// separated by exponential backoff. A non-retryable error is returned
    /// at once; a timeout is retried only once.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        ops: F,
        max_retries: u32,
        options: &TransactionOptions,
    ) -> TransactionResult<T>
    where
        F: Fn(S::Tx) -> Fut,
        Fut: Future<Output = TabulaResult<T>>,
    {
        let max_attempts = max_retries.max(1);
        let mut timeouts = 0u32;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = self.execute(&ops, options).await;
            if result.success {
                if attempt > 1 {
                    tracing::debug!(attempt, "Transaction succeeded after retry");
                }
                return result;
            }
            let Some(error) = result.error.clone() else {
                return result;
            };
            if !error.is_retryable() {
                return result;
            }

            if error.is_timeout() {
                timeouts += 1;
            }
            if attempt >= max_attempts || timeouts > 1 {
                tracing::error!(attempts = attempt, error = %error, "Transaction failed after retries");
                let reason = format!("Transaction failed after {} attempts: {}", attempt, error);
                return TransactionResult::rolled_back(error, reason);
            }

            let backoff = self.retry.backoff_for(attempt);
            tracing::warn!(
                attempt,
                max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Retryable transaction failure, backing off"
            );
            sleep(backoff).await;
        }
    }

    /// [`execute_with_retry`](Self::execute_with_retry) bounded by the
    /// configured `retry.max_retries`.
    pub async fn execute_with_default_retry<T, F, Fut>(
        &self,
        ops: F,
        options: &TransactionOptions,
    ) -> TransactionResult<T>
    where
        F: Fn(S::Tx) -> Fut,
        Fut: Future<Output = TabulaResult<T>>,
    {
        self.execute_with_retry(ops, self.retry.max_retries, options).await
    }
}
