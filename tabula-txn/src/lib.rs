//! Tabula Transactions - Atomic Cascading Writes
//!
//! [`TransactionManager`] runs closures against one store transaction with
//! bounded acquisition and execution time, reports the outcome as a
//! [`TransactionResult`], and retries transient conflicts with exponential
//! backoff. The cascading operations in [`cascade`] build on it so that
//! multi-record writes (row with cells, table teardown, tenant bootstrap,
//! column type change) never apply partially.

pub mod cascade;
pub mod manager;
pub mod result;

pub use cascade::{
    BootstrappedTenant, BulkImport, CellInput, ColumnMigration, RowWithCells, TableDeletion,
    TenantBootstrap, UserDeletion, DEFAULT_DATABASE_NAME,
};
pub use manager::TransactionManager;
pub use result::{TransactionOptions, TransactionResult};
