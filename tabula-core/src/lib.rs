//! Tabula Core - Entity Types
//!
//! Pure data structures shared by every other crate in the workspace: the
//! tenant → database → table → column → row → cell hierarchy, the closed
//! [`CellValue`] sum type, the error taxonomy and configuration.
//! This crate contains no storage or caching behaviour.

pub mod config;
pub mod entities;
pub mod enums;
pub mod error;
pub mod identity;
pub mod value;

pub use config::{
    AnalyzerConfig, CacheConfig, RetryConfig, SamplingStrategy, TabulaConfig, TransactionConfig,
};
pub use entities::{
    Account, Cell, Column, Database, Permission, Row, Session, Table, Tenant, User, UserRole,
};
pub use enums::{EntityType, IsolationLevel};
pub use error::{
    ConfigError, ConversionError, ErrorKind, StorageError, TabulaError, TabulaResult,
    TimeoutError, ValidationError,
};
pub use identity::{
    AccountId, CellId, ColumnId, DatabaseId, EntityIdType, PermissionId, RowId,
    SessionId, TableId, TenantId, Timestamp, UserId,
};
pub use value::{CellValue, ColumnType, ColumnTypeParseError};
