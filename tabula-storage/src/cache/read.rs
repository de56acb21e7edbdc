//! Cache read results carrying staleness metadata.

use std::time::Duration;

/// A value served from the cache.
///
/// Values past their stale-while-revalidate point are still returned but
/// flagged, so callers can schedule a refresh. The cache never refreshes on
/// its own.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead<T> {
    value: T,
    age: Duration,
    is_stale: bool,
}

impl<T> CacheRead<T> {
    pub(crate) fn new(value: T, age: Duration, is_stale: bool) -> Self {
        Self {
            value,
            age,
            is_stale,
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Time since the entry was last written.
    pub fn age(&self) -> Duration {
        self.age
    }

    /// True once the entry is past its stale-while-revalidate point.
    pub fn is_stale(&self) -> bool {
        self.is_stale
    }

    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            age: self.age,
            is_stale: self.is_stale,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}
