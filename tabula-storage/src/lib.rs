//! Tabula Storage - Store Traits, In-Memory Store and Read Cache
//!
//! Defines the relational store abstraction the transaction manager and the
//! type-change analyzer talk to, an in-memory transactional implementation,
//! and the process-local [`cache::CacheLayer`] that fronts reads.

pub mod cache;
pub mod memory;

pub use cache::{
    BatchRequest, CacheEntity, CacheKeys, CacheLayer, CacheRead, CacheStats, CacheStrategy,
    QueryOp, SweeperHandle,
};
pub use memory::{FaultPoint, InMemoryStore, InMemoryTransaction, MutationKind, StoreCounts};

use async_trait::async_trait;
use tabula_core::{
    Account, Cell, CellValue, Column, ColumnId, ColumnType, Database, DatabaseId, IsolationLevel,
    Permission, Row, RowId, SamplingStrategy, Session, TabulaResult, Table, TableId, Tenant,
    TenantId, Timestamp, User, UserId,
};

// ============================================================================
// READ SIDE
// ============================================================================

/// Relational store holding the tenant/database/table/column/row/cell schema.
///
/// Reads issued directly on the store see committed data only. Writes go
/// through a [`StoreTransaction`] obtained from [`RelationalStore::begin`].
#[async_trait]
pub trait RelationalStore: Send + Sync + 'static {
    /// Transaction handle type produced by this store.
    type Tx: StoreTransaction;

    /// Open a transaction at the given isolation level.
    ///
    /// May wait for a free connection; callers bound the wait themselves.
    async fn begin(&self, isolation: IsolationLevel) -> TabulaResult<Self::Tx>;

    async fn tenant_get(&self, id: TenantId) -> TabulaResult<Option<Tenant>>;

    async fn user_get(&self, id: UserId) -> TabulaResult<Option<User>>;

    async fn database_get(&self, id: DatabaseId) -> TabulaResult<Option<Database>>;

    async fn table_get(&self, id: TableId) -> TabulaResult<Option<Table>>;

    async fn column_get(&self, id: ColumnId) -> TabulaResult<Option<Column>>;

    /// Columns of a table sorted by display order.
    async fn column_list_by_table(&self, table_id: TableId) -> TabulaResult<Vec<Column>>;

    async fn row_get(&self, id: RowId) -> TabulaResult<Option<Row>>;

    /// Rows of a table in creation order, optionally limited.
    async fn row_list_by_table(
        &self,
        table_id: TableId,
        limit: Option<usize>,
    ) -> TabulaResult<Vec<Row>>;

    async fn row_count_by_table(&self, table_id: TableId) -> TabulaResult<u64>;

    async fn cell_list_by_row(&self, row_id: RowId) -> TabulaResult<Vec<Cell>>;

    /// Exact number of cells stored under a column.
    async fn cell_count_by_column(&self, column_id: ColumnId) -> TabulaResult<u64>;

    /// Up to `limit` cells of a column, chosen according to `strategy`.
    async fn cell_sample_by_column(
        &self,
        column_id: ColumnId,
        limit: usize,
        strategy: SamplingStrategy,
    ) -> TabulaResult<Vec<Cell>>;

    async fn permission_list_by_table(&self, table_id: TableId) -> TabulaResult<Vec<Permission>>;
}

// ============================================================================
// WRITE SIDE
// ============================================================================

/// A transactional handle on the relational store.
///
/// Handles are cheap to clone; all clones refer to the same transaction.
/// Every write is invisible to other callers until [`commit`] succeeds, and
/// [`rollback`] discards all of them. Once either has run, further calls fail
/// with `StorageError::TransactionClosed`.
///
/// Delete operations return the number of records removed.
///
/// [`commit`]: StoreTransaction::commit
/// [`rollback`]: StoreTransaction::rollback
#[async_trait]
pub trait StoreTransaction: Clone + Send + Sync + 'static {
    fn isolation_level(&self) -> IsolationLevel;

    // === Reads (see this transaction's own writes) ===

    async fn user_get(&self, id: UserId) -> TabulaResult<Option<User>>;

    async fn table_get(&self, id: TableId) -> TabulaResult<Option<Table>>;

    async fn column_get(&self, id: ColumnId) -> TabulaResult<Option<Column>>;

    async fn row_get(&self, id: RowId) -> TabulaResult<Option<Row>>;

    async fn cell_list_by_column(&self, column_id: ColumnId) -> TabulaResult<Vec<Cell>>;

    // === Inserts ===

    async fn tenant_insert(&self, tenant: &Tenant) -> TabulaResult<()>;

    async fn user_insert(&self, user: &User) -> TabulaResult<()>;

    async fn session_insert(&self, session: &Session) -> TabulaResult<()>;

    async fn account_insert(&self, account: &Account) -> TabulaResult<()>;

    async fn database_insert(&self, database: &Database) -> TabulaResult<()>;

    async fn table_insert(&self, table: &Table) -> TabulaResult<()>;

    async fn column_insert(&self, column: &Column) -> TabulaResult<()>;

    async fn permission_insert(&self, permission: &Permission) -> TabulaResult<()>;

    async fn row_insert(&self, row: &Row) -> TabulaResult<()>;

    async fn cell_insert(&self, cell: &Cell) -> TabulaResult<()>;

    // === Updates ===

    /// Insert or replace the cell at (row, column) and return it.
    async fn cell_upsert(
        &self,
        row_id: RowId,
        column_id: ColumnId,
        value: CellValue,
    ) -> TabulaResult<Cell>;

    async fn cell_update_value(&self, cell: &Cell) -> TabulaResult<()>;

    async fn row_touch(&self, row_id: RowId, at: Timestamp) -> TabulaResult<()>;

    async fn column_set_type(&self, column_id: ColumnId, column_type: ColumnType)
        -> TabulaResult<()>;

    // === Deletes ===

    async fn cell_delete(&self, row_id: RowId, column_id: ColumnId) -> TabulaResult<u64>;

    async fn cell_delete_by_row(&self, row_id: RowId) -> TabulaResult<u64>;

    async fn cell_delete_by_table(&self, table_id: TableId) -> TabulaResult<u64>;

    async fn row_delete(&self, row_id: RowId) -> TabulaResult<u64>;

    async fn row_delete_by_table(&self, table_id: TableId) -> TabulaResult<u64>;

    async fn column_delete_by_table(&self, table_id: TableId) -> TabulaResult<u64>;

    async fn permission_delete_by_table(&self, table_id: TableId) -> TabulaResult<u64>;

    async fn permission_delete_by_user(&self, user_id: UserId) -> TabulaResult<u64>;

    async fn session_delete_by_user(&self, user_id: UserId) -> TabulaResult<u64>;

    async fn account_delete_by_user(&self, user_id: UserId) -> TabulaResult<u64>;

    async fn table_delete(&self, table_id: TableId) -> TabulaResult<u64>;

    async fn user_delete(&self, user_id: UserId) -> TabulaResult<u64>;

    // === Completion ===

    async fn commit(&self) -> TabulaResult<()>;

    async fn rollback(&self) -> TabulaResult<()>;
}
