//! The in-process cache map.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tabula_core::{CacheConfig, TabulaResult, ValidationError};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::read::CacheRead;
use super::strategy::CacheStrategy;

#[derive(Debug)]
struct CacheEntry {
    data: serde_json::Value,
    written_at: Instant,
    stale_at: Instant,
    expires_at: Instant,
    tags: Vec<String>,
    /// Insertion order; kept across re-sets of the same key.
    inserted_seq: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Counters describing cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    /// Hits served after the stale-while-revalidate point. Included in `hits`.
    pub stale_hits: u64,
    pub misses: u64,
    /// Entries removed to make room.
    pub evictions: u64,
    pub entry_count: u64,
}

impl CacheStats {
    /// Hit rate in `0.0..=1.0`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Process-local read cache with dual expiry.
///
/// Values are stored as JSON so one map holds every entity class. Cache
/// conditions (miss, expiry, eviction, undecodable entry) never surface as
/// errors; they degrade to a miss.
///
/// The cache is not coherent across processes. Each instance only drops
/// entries for mutations it is told about.
#[derive(Debug)]
pub struct CacheLayer {
    entries: DashMap<String, CacheEntry>,
    config: CacheConfig,
    next_seq: AtomicU64,
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl Default for CacheLayer {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl CacheLayer {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            next_seq: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            stale_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get a live value, stale or not.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.read(key).map(CacheRead::into_value)
    }

    /// Get a live value together with its staleness.
    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Option<CacheRead<T>> {
        let now = Instant::now();
        let found = self.entries.get(key).map(|entry| {
            if entry.is_expired(now) {
                None
            } else {
                Some((
                    entry.data.clone(),
                    now.saturating_duration_since(entry.written_at),
                    now >= entry.stale_at,
                ))
            }
        });

        let (data, age, is_stale) = match found {
            Some(Some(live)) => live,
            Some(None) => {
                self.entries.remove_if(key, |_, e| e.is_expired(now));
                return self.record_miss(key);
            }
            None => return self.record_miss(key),
        };

        match serde_json::from_value::<T>(data) {
            Ok(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                if is_stale {
                    self.stale_hits.fetch_add(1, Ordering::Relaxed);
                }
                debug!(key, stale = is_stale, "Cache hit");
                Some(CacheRead::new(value, age, is_stale))
            }
            Err(e) => {
                warn!(key, error = %e, "Cached value does not decode as requested type");
                self.record_miss(key)
            }
        }
    }

    fn record_miss<T>(&self, key: &str) -> Option<T> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key, "Cache miss");
        None
    }

    /// Store `value` under `key`.
    ///
    /// Evicts a batch of the oldest-inserted entries first when a new key
    /// would exceed capacity. A value that fails to serialize is not cached.
    pub fn set<T: Serialize + ?Sized>(&self, key: impl Into<String>, value: &T, strategy: &CacheStrategy) {
        let key = key.into();
        let data = match serde_json::to_value(value) {
            Ok(data) => data,
            Err(e) => {
                warn!(key = %key, error = %e, "Value not cacheable");
                return;
            }
        };

        if !self.entries.contains_key(&key) && self.entries.len() >= self.config.max_entries {
            self.evict_oldest(self.config.eviction_batch());
        }

        let now = Instant::now();
        let expires_at = now + strategy.ttl;
        let stale_at = now + strategy.effective_swr();

        self.entries
            .entry(key)
            .and_modify(|entry| {
                entry.data = data.clone();
                entry.written_at = now;
                entry.stale_at = stale_at;
                entry.expires_at = expires_at;
                entry.tags = strategy.tags.clone();
            })
            .or_insert_with(|| CacheEntry {
                data: data.clone(),
                written_at: now,
                stale_at,
                expires_at,
                tags: strategy.tags.clone(),
                inserted_seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            });

        // Concurrent inserts of new keys can pass the capacity check together.
        let overflow = self.entries.len().saturating_sub(self.config.max_entries);
        if overflow > 0 {
            self.evict_oldest(overflow);
        }
    }

    fn evict_oldest(&self, count: usize) {
        let mut by_age: Vec<(u64, String)> = self
            .entries
            .iter()
            .map(|e| (e.inserted_seq, e.key().clone()))
            .collect();
        let count = count.min(by_age.len());
        if count == 0 {
            return;
        }
        if count < by_age.len() {
            by_age.select_nth_unstable(count - 1);
        }

        let mut evicted = 0u64;
        for (_, key) in by_age.into_iter().take(count) {
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
        debug!(evicted, "Cache at capacity, evicted oldest entries");
    }

    /// Remove one key. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every key matching `pattern`, a regular expression anchored
    /// at the start of the key. Returns the number of entries removed.
    pub fn invalidate(&self, pattern: &str) -> TabulaResult<usize> {
        let regex = Regex::new(&format!("^(?:{})", pattern)).map_err(|e| {
            ValidationError::InvalidValue {
                field: "pattern".to_string(),
                reason: e.to_string(),
            }
        })?;

        let mut removed = 0usize;
        self.entries.retain(|key, _| {
            let matched = regex.is_match(key);
            if matched {
                removed += 1;
            }
            !matched
        });
        debug!(pattern, removed, "Invalidated cache pattern");
        Ok(removed)
    }

    /// Remove every entry carrying at least one of `tags`.
    pub fn invalidate_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        let mut removed = 0usize;
        self.entries.retain(|_, entry| {
            let matched = entry
                .tags
                .iter()
                .any(|t| tags.iter().any(|wanted| wanted.as_ref() == t));
            if matched {
                removed += 1;
            }
            !matched
        });
        debug!(removed, "Invalidated cache tags");
        removed
    }

    /// Remove entries past their expiry. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0usize;
        self.entries.retain(|_, entry| {
            let expired = entry.is_expired(now);
            if expired {
                removed += 1;
            }
            !expired
        });
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entry_count: self.entries.len() as u64,
        }
    }
}
