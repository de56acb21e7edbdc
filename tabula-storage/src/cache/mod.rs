//! Process-local read cache with dual expiry.
//!
//! Every entry carries two deadlines: past `stale_at` it is still served but
//! flagged stale (stale-while-revalidate), past `expires_at` it is gone.
//! Entries are dropped by expiry, by capacity eviction (oldest inserted
//! first), by regex pattern, or by tag.
//!
//! # Example
//!
//! ```ignore
//! let cache = Arc::new(CacheLayer::new(config.cache.clone()));
//! let sweeper = cache.spawn_sweeper();
//!
//! let rows = cache
//!     .find_many_with_cache(CacheEntity::Row, &query, &CacheEntity::Row.default_strategy(), || {
//!         store.row_list_by_table(table_id, Some(50))
//!     })
//!     .await?;
//!
//! // After a write to the table:
//! cache.invalidate(&CacheKeys::table_scope_pattern(CacheEntity::Row, tenant_id, table_id))?;
//! sweeper.shutdown().await;
//! ```

pub mod keys;
pub mod layer;
pub mod read;
pub mod read_through;
pub mod strategy;
pub mod sweeper;

pub use keys::{CacheKeys, QueryOp};
pub use layer::{CacheLayer, CacheStats};
pub use read::CacheRead;
pub use read_through::BatchRequest;
pub use strategy::{CacheEntity, CacheStrategy};
pub use sweeper::SweeperHandle;
