//! Read-through helpers and batched reads.
//!
//! The query closure's error type is left generic and returned untouched, so
//! a caller sees exactly the error its own query produced.

use std::future::Future;

use futures_util::future::try_join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use super::keys::{CacheKeys, QueryOp};
use super::layer::CacheLayer;
use super::strategy::{CacheEntity, CacheStrategy};

/// One entry of [`CacheLayer::batch_query`].
pub struct BatchRequest<F> {
    pub cache_key: String,
    pub strategy: CacheStrategy,
    /// Query run on a miss.
    pub operation: F,
}

impl<F> BatchRequest<F> {
    pub fn new(cache_key: impl Into<String>, strategy: CacheStrategy, operation: F) -> Self {
        Self {
            cache_key: cache_key.into(),
            strategy,
            operation,
        }
    }
}

impl CacheLayer {
    fn query_key<Q: Serialize + ?Sized>(&self, op: QueryOp, entity: CacheEntity, query: &Q) -> Option<String> {
        match CacheKeys::query(op, entity, query) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(op = op.as_str(), entity = entity.as_str(), error = %e, "Query not serializable, bypassing cache");
                None
            }
        }
    }

    async fn read_through<T, F, Fut, E>(
        &self,
        key: Option<String>,
        strategy: &CacheStrategy,
        fetch: F,
        cacheable: fn(&T) -> bool,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(key) = key.as_deref() {
            if let Some(hit) = self.get::<T>(key) {
                return Ok(hit);
            }
        }

        let value = fetch().await?;
        if let Some(key) = key {
            if cacheable(&value) {
                self.set(key, &value, strategy);
            }
        }
        Ok(value)
    }

    /// Fetch at most one record through the cache. Absent results are not
    /// cached.
    pub async fn find_one_with_cache<T, Q, F, Fut, E>(
        &self,
        entity: CacheEntity,
        query: &Q,
        strategy: &CacheStrategy,
        fetch: F,
    ) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        Q: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let key = self.query_key(QueryOp::FindOne, entity, query);
        self.read_through(key, strategy, fetch, Option::is_some).await
    }

    /// Fetch a list of records through the cache.
    pub async fn find_many_with_cache<T, Q, F, Fut, E>(
        &self,
        entity: CacheEntity,
        query: &Q,
        strategy: &CacheStrategy,
        fetch: F,
    ) -> Result<Vec<T>, E>
    where
        T: Serialize + DeserializeOwned,
        Q: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<T>, E>>,
    {
        let key = self.query_key(QueryOp::FindMany, entity, query);
        self.read_through(key, strategy, fetch, |_| true).await
    }

    /// Fetch a count through the cache.
    pub async fn count_with_cache<Q, F, Fut, E>(
        &self,
        entity: CacheEntity,
        query: &Q,
        strategy: &CacheStrategy,
        fetch: F,
    ) -> Result<u64, E>
    where
        Q: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u64, E>>,
    {
        let key = self.query_key(QueryOp::Count, entity, query);
        self.read_through(key, strategy, fetch, |_| true).await
    }

    /// Resolve several keyed reads at once.
    ///
    /// Hits are answered from the cache first; only the misses run, all
    /// concurrently. Results come back in request order. The first failing
    /// query fails the whole batch.
    pub async fn batch_query<T, F, Fut, E>(&self, requests: Vec<BatchRequest<F>>) -> Result<Vec<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut results: Vec<Option<T>> = Vec::with_capacity(requests.len());
        let mut misses = Vec::new();
        for (idx, request) in requests.into_iter().enumerate() {
            match self.get::<T>(&request.cache_key) {
                Some(hit) => results.push(Some(hit)),
                None => {
                    results.push(None);
                    misses.push((idx, request));
                }
            }
        }

        let fetched = try_join_all(misses.into_iter().map(|(idx, request)| async move {
            let value = (request.operation)().await?;
            Ok::<_, E>((idx, request.cache_key, request.strategy, value))
        }))
        .await?;

        for (idx, key, strategy, value) in fetched {
            self.set(key, &value, &strategy);
            results[idx] = Some(value);
        }
        Ok(results.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct RowQuery {
        table: u32,
        limit: usize,
    }

    #[tokio::test]
    async fn test_identical_queries_share_entry() {
        let cache = CacheLayer::default();
        let calls = AtomicUsize::new(0);
        let strategy = CacheEntity::Row.default_strategy();

        let fetch = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(vec![1, 2, 3])
        };

        // Two call sites building the same query independently.
        let first = cache
            .find_many_with_cache(CacheEntity::Row, &RowQuery { table: 5, limit: 10 }, &strategy, fetch)
            .await
            .unwrap();
        let second = cache
            .find_many_with_cache(CacheEntity::Row, &RowQuery { table: 5, limit: 10 }, &strategy, fetch)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_query_error_propagates_unmodified() {
        let cache = CacheLayer::default();
        let strategy = CacheEntity::Count.default_strategy();
        let result = cache
            .count_with_cache(CacheEntity::Count, &json!({"table": 1}), &strategy, || async {
                Err::<u64, _>("store down")
            })
            .await;
        assert_eq!(result, Err("store down"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_find_one_does_not_cache_absence() {
        let cache = CacheLayer::default();
        let strategy = CacheEntity::User.default_strategy();
        let query = json!({"email": "a@b.test"});

        let missing: Option<String> = cache
            .find_one_with_cache(CacheEntity::User, &query, &strategy, || async {
                Ok::<_, ()>(None)
            })
            .await
            .unwrap();
        assert!(missing.is_none());
        assert!(cache.is_empty());

        let found = cache
            .find_one_with_cache(CacheEntity::User, &query, &strategy, || async {
                Ok::<_, ()>(Some("ada".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(found.as_deref(), Some("ada"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_batch_runs_only_misses_in_order() {
        let cache = CacheLayer::default();
        let strategy = CacheStrategy::seconds(60, 30);
        cache.set("k1", &10, &strategy);
        cache.set("k3", &30, &strategy);

        let calls = AtomicUsize::new(0);
        let calls_ref = &calls;
        let requests: Vec<_> = (0..5)
            .map(|i| {
                BatchRequest::new(format!("k{}", i), strategy.clone(), move || async move {
                    calls_ref.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(i * 100)
                })
            })
            .collect();

        let values = cache.batch_query(requests).await.unwrap();
        assert_eq!(values, vec![0, 10, 200, 30, 400]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.get::<i32>("k4"), Some(400));
    }

    #[tokio::test]
    async fn test_batch_failure_fails_whole_batch() {
        let cache = CacheLayer::default();
        let strategy = CacheStrategy::seconds(60, 30);
        let requests: Vec<_> = (0..3)
            .map(|i| {
                BatchRequest::new(format!("k{}", i), strategy.clone(), move || async move {
                    if i == 1 {
                        Err("boom".to_string())
                    } else {
                        Ok(i)
                    }
                })
            })
            .collect();

        let result: Result<Vec<i32>, String> = cache.batch_query(requests).await;
        assert_eq!(result, Err("boom".to_string()));
    }
}
