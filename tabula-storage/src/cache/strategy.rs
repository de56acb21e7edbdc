//! Per-entity caching strategies.

use std::fmt;
use std::time::Duration;

/// How long a cached value lives and when it becomes due for refresh.
///
/// `ttl` bounds how long the value may be served at all; `swr` marks the
/// point after which it is still served but considered stale. A `swr` longer
/// than `ttl` is treated as equal to `ttl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStrategy {
    pub ttl: Duration,
    pub swr: Duration,
    /// Tags for coarse invalidation via `CacheLayer::invalidate_by_tags`.
    pub tags: Vec<String>,
}

impl CacheStrategy {
    pub fn new(ttl: Duration, swr: Duration) -> Self {
        Self {
            ttl,
            swr,
            tags: Vec::new(),
        }
    }

    /// Strategy with both bounds given in whole seconds.
    pub fn seconds(ttl: u64, swr: u64) -> Self {
        Self::new(Duration::from_secs(ttl), Duration::from_secs(swr))
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Stale-after duration, never longer than `ttl`.
    pub fn effective_swr(&self) -> Duration {
        self.swr.min(self.ttl)
    }
}

/// Entity classes with a default caching strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheEntity {
    User,
    Tenant,
    Database,
    Table,
    Column,
    Row,
    Cell,
    Permission,
    Count,
    Dashboard,
    Widget,
    Invoice,
}

impl CacheEntity {
    pub const ALL: [CacheEntity; 12] = [
        CacheEntity::User,
        CacheEntity::Tenant,
        CacheEntity::Database,
        CacheEntity::Table,
        CacheEntity::Column,
        CacheEntity::Row,
        CacheEntity::Cell,
        CacheEntity::Permission,
        CacheEntity::Count,
        CacheEntity::Dashboard,
        CacheEntity::Widget,
        CacheEntity::Invoice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheEntity::User => "user",
            CacheEntity::Tenant => "tenant",
            CacheEntity::Database => "database",
            CacheEntity::Table => "table",
            CacheEntity::Column => "column",
            CacheEntity::Row => "row",
            CacheEntity::Cell => "cell",
            CacheEntity::Permission => "permission",
            CacheEntity::Count => "count",
            CacheEntity::Dashboard => "dashboard",
            CacheEntity::Widget => "widget",
            CacheEntity::Invoice => "invoice",
        }
    }

    /// Default strategy, tagged with the entity name.
    ///
    /// Volatile entities (cells, counts) expire quickly; tenants and users
    /// change rarely and are kept longest.
    pub fn default_strategy(&self) -> CacheStrategy {
        let (ttl, swr) = match self {
            CacheEntity::User => (600, 300),
            CacheEntity::Tenant => (1800, 900),
            CacheEntity::Database
            | CacheEntity::Table
            | CacheEntity::Column
            | CacheEntity::Permission
            | CacheEntity::Invoice => (300, 120),
            CacheEntity::Row => (60, 30),
            CacheEntity::Cell | CacheEntity::Count => (30, 10),
            CacheEntity::Dashboard | CacheEntity::Widget => (120, 60),
        };
        CacheStrategy::seconds(ttl, swr).with_tag(self.as_str())
    }
}

impl fmt::Display for CacheEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_strategies_are_tagged_and_ordered() {
        for entity in CacheEntity::ALL {
            let strategy = entity.default_strategy();
            assert_eq!(strategy.tags, vec![entity.as_str().to_string()]);
            assert!(strategy.swr <= strategy.ttl, "{entity} has swr > ttl");
        }
    }

    #[test]
    fn test_volatile_entities_expire_sooner() {
        let cell = CacheEntity::Cell.default_strategy();
        let tenant = CacheEntity::Tenant.default_strategy();
        assert!(cell.ttl < tenant.ttl);
        assert_eq!(CacheEntity::Count.default_strategy().ttl, Duration::from_secs(30));
        assert_eq!(CacheEntity::User.default_strategy().ttl, Duration::from_secs(600));
    }

    #[test]
    fn test_swr_clamped_to_ttl() {
        let strategy = CacheStrategy::seconds(5, 60);
        assert_eq!(strategy.effective_swr(), Duration::from_secs(5));
    }
}
