//! In-memory relational store with snapshot transactions.
//!
//! Each transaction works on a private snapshot of the committed state and
//! records its writes in a journal. Commit replays the journal against the
//! latest committed state; if a concurrent commit made any write invalid, or
//! changed how many records a bulk delete removes, the whole journal is
//! discarded and the commit fails with a serialization failure. Foreign keys behave like `ON DELETE CASCADE` and are checked on
//! every insert.
//!
//! A semaphore models the connection pool, so a caller holding every
//! connection makes further `begin` calls wait.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use rand::seq::IteratorRandom;
use tabula_core::{
    Account, AccountId, Cell, CellId, CellValue, Column, ColumnId, ColumnType, Database,
    DatabaseId, EntityType, IsolationLevel, Permission, PermissionId, Row, RowId,
    SamplingStrategy, Session, SessionId, StorageError, TabulaError, TabulaResult, Table, TableId,
    Tenant, TenantId, Timestamp, User, UserId,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{RelationalStore, StoreTransaction};

/// Default number of concurrently open transactions.
const DEFAULT_POOL_SIZE: usize = 10;

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct StoreState {
    tenants: BTreeMap<TenantId, Tenant>,
    users: BTreeMap<UserId, User>,
    sessions: BTreeMap<SessionId, Session>,
    accounts: BTreeMap<AccountId, Account>,
    databases: BTreeMap<DatabaseId, Database>,
    tables: BTreeMap<TableId, Table>,
    columns: BTreeMap<ColumnId, Column>,
    rows: BTreeMap<RowId, Row>,
    cells: BTreeMap<CellId, Cell>,
    /// Unique index on (row_id, column_id).
    cell_index: HashMap<(RowId, ColumnId), CellId>,
    permissions: BTreeMap<PermissionId, Permission>,
}

/// Kind of a primitive write, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    InsertTenant,
    InsertUser,
    InsertSession,
    InsertAccount,
    InsertDatabase,
    InsertTable,
    InsertColumn,
    InsertPermission,
    InsertRow,
    InsertCell,
    UpsertCell,
    UpdateCellValue,
    TouchRow,
    SetColumnType,
    DeleteCell,
    DeleteCellsByRow,
    DeleteCellsByTable,
    DeleteRow,
    DeleteRowsByTable,
    DeleteColumnsByTable,
    DeletePermissionsByTable,
    DeletePermissionsByUser,
    DeleteSessionsByUser,
    DeleteAccountsByUser,
    DeleteTable,
    DeleteUser,
}

#[derive(Debug, Clone)]
enum Mutation {
    InsertTenant(Tenant),
    InsertUser(User),
    InsertSession(Session),
    InsertAccount(Account),
    InsertDatabase(Database),
    InsertTable(Table),
    InsertColumn(Column),
    InsertPermission(Permission),
    InsertRow(Row),
    InsertCell(Cell),
    UpsertCell(Cell),
    UpdateCellValue(Cell),
    TouchRow { row_id: RowId, at: Timestamp },
    SetColumnType { column_id: ColumnId, column_type: ColumnType },
    DeleteCell { row_id: RowId, column_id: ColumnId },
    DeleteCellsByRow(RowId),
    DeleteCellsByTable(TableId),
    DeleteRow(RowId),
    DeleteRowsByTable(TableId),
    DeleteColumnsByTable(TableId),
    DeletePermissionsByTable(TableId),
    DeletePermissionsByUser(UserId),
    DeleteSessionsByUser(UserId),
    DeleteAccountsByUser(UserId),
    DeleteTable(TableId),
    DeleteUser(UserId),
}

impl Mutation {
    fn kind(&self) -> MutationKind {
        match self {
            Mutation::InsertTenant(_) => MutationKind::InsertTenant,
            Mutation::InsertUser(_) => MutationKind::InsertUser,
            Mutation::InsertSession(_) => MutationKind::InsertSession,
            Mutation::InsertAccount(_) => MutationKind::InsertAccount,
            Mutation::InsertDatabase(_) => MutationKind::InsertDatabase,
            Mutation::InsertTable(_) => MutationKind::InsertTable,
            Mutation::InsertColumn(_) => MutationKind::InsertColumn,
            Mutation::InsertPermission(_) => MutationKind::InsertPermission,
            Mutation::InsertRow(_) => MutationKind::InsertRow,
            Mutation::InsertCell(_) => MutationKind::InsertCell,
            Mutation::UpsertCell(_) => MutationKind::UpsertCell,
            Mutation::UpdateCellValue(_) => MutationKind::UpdateCellValue,
            Mutation::TouchRow { .. } => MutationKind::TouchRow,
            Mutation::SetColumnType { .. } => MutationKind::SetColumnType,
            Mutation::DeleteCell { .. } => MutationKind::DeleteCell,
            Mutation::DeleteCellsByRow(_) => MutationKind::DeleteCellsByRow,
            Mutation::DeleteCellsByTable(_) => MutationKind::DeleteCellsByTable,
            Mutation::DeleteRow(_) => MutationKind::DeleteRow,
            Mutation::DeleteRowsByTable(_) => MutationKind::DeleteRowsByTable,
            Mutation::DeleteColumnsByTable(_) => MutationKind::DeleteColumnsByTable,
            Mutation::DeletePermissionsByTable(_) => MutationKind::DeletePermissionsByTable,
            Mutation::DeletePermissionsByUser(_) => MutationKind::DeletePermissionsByUser,
            Mutation::DeleteSessionsByUser(_) => MutationKind::DeleteSessionsByUser,
            Mutation::DeleteAccountsByUser(_) => MutationKind::DeleteAccountsByUser,
            Mutation::DeleteTable(_) => MutationKind::DeleteTable,
            Mutation::DeleteUser(_) => MutationKind::DeleteUser,
        }
    }

    /// Bulk deletes whose affected count is reported to the caller.
    fn reports_count(&self) -> bool {
        matches!(
            self,
            Mutation::DeleteCellsByRow(_)
                | Mutation::DeleteCellsByTable(_)
                | Mutation::DeleteRowsByTable(_)
                | Mutation::DeleteColumnsByTable(_)
                | Mutation::DeletePermissionsByTable(_)
                | Mutation::DeletePermissionsByUser(_)
                | Mutation::DeleteSessionsByUser(_)
                | Mutation::DeleteAccountsByUser(_)
        )
    }
}

fn fk_violation(constraint: &str, detail: String) -> TabulaError {
    StorageError::ForeignKeyViolation {
        constraint: constraint.to_string(),
        detail,
    }
    .into()
}

fn unique_violation(constraint: &str, detail: String) -> TabulaError {
    StorageError::UniqueViolation {
        constraint: constraint.to_string(),
        detail,
    }
    .into()
}

fn ensure_vacant<K: Ord, V>(
    map: &BTreeMap<K, V>,
    key: &K,
    constraint: &str,
    id: impl std::fmt::Display,
) -> TabulaResult<()> {
    if map.contains_key(key) {
        return Err(unique_violation(constraint, format!("Key (id)=({}) already exists", id)));
    }
    Ok(())
}

impl StoreState {
    fn apply(&mut self, mutation: &Mutation) -> TabulaResult<u64> {
        match mutation {
            Mutation::InsertTenant(t) => {
                ensure_vacant(&self.tenants, &t.id, "tenants_pkey", t.id)?;
                self.tenants.insert(t.id, t.clone());
                Ok(1)
            }
            Mutation::InsertUser(u) => {
                ensure_vacant(&self.users, &u.id, "users_pkey", u.id)?;
                if !self.tenants.contains_key(&u.tenant_id) {
                    return Err(fk_violation(
                        "users_tenant_id_fkey",
                        format!("tenant {} does not exist", u.tenant_id),
                    ));
                }
                if self
                    .users
                    .values()
                    .any(|existing| existing.tenant_id == u.tenant_id && existing.email == u.email)
                {
                    return Err(unique_violation(
                        "users_tenant_id_email_key",
                        format!("email {} already registered", u.email),
                    ));
                }
                self.users.insert(u.id, u.clone());
                Ok(1)
            }
            Mutation::InsertSession(s) => {
                ensure_vacant(&self.sessions, &s.id, "sessions_pkey", s.id)?;
                if !self.users.contains_key(&s.user_id) {
                    return Err(fk_violation(
                        "sessions_user_id_fkey",
                        format!("user {} does not exist", s.user_id),
                    ));
                }
                self.sessions.insert(s.id, s.clone());
                Ok(1)
            }
            Mutation::InsertAccount(a) => {
                ensure_vacant(&self.accounts, &a.id, "accounts_pkey", a.id)?;
                if !self.users.contains_key(&a.user_id) {
                    return Err(fk_violation(
                        "accounts_user_id_fkey",
                        format!("user {} does not exist", a.user_id),
                    ));
                }
                self.accounts.insert(a.id, a.clone());
                Ok(1)
            }
            Mutation::InsertDatabase(d) => {
                ensure_vacant(&self.databases, &d.id, "databases_pkey", d.id)?;
                if !self.tenants.contains_key(&d.tenant_id) {
                    return Err(fk_violation(
                        "databases_tenant_id_fkey",
                        format!("tenant {} does not exist", d.tenant_id),
                    ));
                }
                self.databases.insert(d.id, d.clone());
                Ok(1)
            }
            Mutation::InsertTable(t) => {
                ensure_vacant(&self.tables, &t.id, "tables_pkey", t.id)?;
                if !self.databases.contains_key(&t.database_id) {
                    return Err(fk_violation(
                        "tables_database_id_fkey",
                        format!("database {} does not exist", t.database_id),
                    ));
                }
                self.tables.insert(t.id, t.clone());
                Ok(1)
            }
            Mutation::InsertColumn(c) => {
                ensure_vacant(&self.columns, &c.id, "columns_pkey", c.id)?;
                if !self.tables.contains_key(&c.table_id) {
                    return Err(fk_violation(
                        "columns_table_id_fkey",
                        format!("table {} does not exist", c.table_id),
                    ));
                }
                self.columns.insert(c.id, c.clone());
                Ok(1)
            }
            Mutation::InsertPermission(p) => {
                ensure_vacant(&self.permissions, &p.id, "permissions_pkey", p.id)?;
                if !self.tables.contains_key(&p.table_id) {
                    return Err(fk_violation(
                        "permissions_table_id_fkey",
                        format!("table {} does not exist", p.table_id),
                    ));
                }
                if !self.users.contains_key(&p.user_id) {
                    return Err(fk_violation(
                        "permissions_user_id_fkey",
                        format!("user {} does not exist", p.user_id),
                    ));
                }
                self.permissions.insert(p.id, p.clone());
                Ok(1)
            }
            Mutation::InsertRow(r) => {
                ensure_vacant(&self.rows, &r.id, "rows_pkey", r.id)?;
                if !self.tables.contains_key(&r.table_id) {
                    return Err(fk_violation(
                        "rows_table_id_fkey",
                        format!("table {} does not exist", r.table_id),
                    ));
                }
                self.rows.insert(r.id, r.clone());
                Ok(1)
            }
            Mutation::InsertCell(c) => {
                ensure_vacant(&self.cells, &c.id, "cells_pkey", c.id)?;
                self.check_cell_parents(c.row_id, c.column_id)?;
                if self.cell_index.contains_key(&(c.row_id, c.column_id)) {
                    return Err(unique_violation(
                        "cells_row_id_column_id_key",
                        format!("row {} already has a cell for column {}", c.row_id, c.column_id),
                    ));
                }
                self.cell_index.insert((c.row_id, c.column_id), c.id);
                self.cells.insert(c.id, c.clone());
                Ok(1)
            }
            Mutation::UpsertCell(c) => {
                self.check_cell_parents(c.row_id, c.column_id)?;
                match self.cell_index.get(&(c.row_id, c.column_id)).copied() {
                    Some(existing_id) => {
                        if let Some(existing) = self.cells.get_mut(&existing_id) {
                            existing.value = c.value.clone();
                        }
                    }
                    None => {
                        ensure_vacant(&self.cells, &c.id, "cells_pkey", c.id)?;
                        self.cell_index.insert((c.row_id, c.column_id), c.id);
                        self.cells.insert(c.id, c.clone());
                    }
                }
                Ok(1)
            }
            Mutation::UpdateCellValue(c) => {
                let cell = self
                    .cells
                    .get_mut(&c.id)
                    .ok_or_else(|| StorageError::not_found(EntityType::Cell, c.id))?;
                cell.value = c.value.clone();
                Ok(1)
            }
            Mutation::TouchRow { row_id, at } => {
                let row = self
                    .rows
                    .get_mut(row_id)
                    .ok_or_else(|| StorageError::not_found(EntityType::Row, *row_id))?;
                row.updated_at = *at;
                Ok(1)
            }
            Mutation::SetColumnType {
                column_id,
                column_type,
            } => {
                let column = self
                    .columns
                    .get_mut(column_id)
                    .ok_or_else(|| StorageError::not_found(EntityType::Column, *column_id))?;
                column.column_type = *column_type;
                Ok(1)
            }
            Mutation::DeleteCell { row_id, column_id } => {
                Ok(self.remove_cells(|c| c.row_id == *row_id && c.column_id == *column_id))
            }
            Mutation::DeleteCellsByRow(row_id) => Ok(self.remove_cells(|c| c.row_id == *row_id)),
            Mutation::DeleteCellsByTable(table_id) => {
                let rows = self.row_ids_of(*table_id);
                Ok(self.remove_cells(|c| rows.contains(&c.row_id)))
            }
            Mutation::DeleteRow(row_id) => {
                if self.rows.remove(row_id).is_none() {
                    return Ok(0);
                }
                self.remove_cells(|c| c.row_id == *row_id);
                Ok(1)
            }
            Mutation::DeleteRowsByTable(table_id) => {
                let rows = self.row_ids_of(*table_id);
                self.remove_cells(|c| rows.contains(&c.row_id));
                self.rows.retain(|_, r| r.table_id != *table_id);
                Ok(rows.len() as u64)
            }
            Mutation::DeleteColumnsByTable(table_id) => {
                let columns: HashSet<ColumnId> = self
                    .columns
                    .values()
                    .filter(|c| c.table_id == *table_id)
                    .map(|c| c.id)
                    .collect();
                self.remove_cells(|c| columns.contains(&c.column_id));
                self.columns.retain(|_, c| c.table_id != *table_id);
                Ok(columns.len() as u64)
            }
            Mutation::DeletePermissionsByTable(table_id) => {
                let before = self.permissions.len();
                self.permissions.retain(|_, p| p.table_id != *table_id);
                Ok((before - self.permissions.len()) as u64)
            }
            Mutation::DeletePermissionsByUser(user_id) => {
                let before = self.permissions.len();
                self.permissions.retain(|_, p| p.user_id != *user_id);
                Ok((before - self.permissions.len()) as u64)
            }
            Mutation::DeleteSessionsByUser(user_id) => {
                let before = self.sessions.len();
                self.sessions.retain(|_, s| s.user_id != *user_id);
                Ok((before - self.sessions.len()) as u64)
            }
            Mutation::DeleteAccountsByUser(user_id) => {
                let before = self.accounts.len();
                self.accounts.retain(|_, a| a.user_id != *user_id);
                Ok((before - self.accounts.len()) as u64)
            }
            Mutation::DeleteTable(table_id) => {
                if !self.tables.contains_key(table_id) {
                    return Ok(0);
                }
                // Foreign keys cascade to anything the caller left behind.
                self.apply(&Mutation::DeleteRowsByTable(*table_id))?;
                self.apply(&Mutation::DeleteColumnsByTable(*table_id))?;
                self.apply(&Mutation::DeletePermissionsByTable(*table_id))?;
                self.tables.remove(table_id);
                Ok(1)
            }
            Mutation::DeleteUser(user_id) => {
                if !self.users.contains_key(user_id) {
                    return Ok(0);
                }
                self.apply(&Mutation::DeleteSessionsByUser(*user_id))?;
                self.apply(&Mutation::DeleteAccountsByUser(*user_id))?;
                self.apply(&Mutation::DeletePermissionsByUser(*user_id))?;
                self.users.remove(user_id);
                Ok(1)
            }
        }
    }

    fn check_cell_parents(&self, row_id: RowId, column_id: ColumnId) -> TabulaResult<()> {
        let row = self.rows.get(&row_id).ok_or_else(|| {
            fk_violation("cells_row_id_fkey", format!("row {} does not exist", row_id))
        })?;
        let column = self.columns.get(&column_id).ok_or_else(|| {
            fk_violation("cells_column_id_fkey", format!("column {} does not exist", column_id))
        })?;
        if row.table_id != column.table_id {
            return Err(fk_violation(
                "cells_column_id_fkey",
                format!("column {} does not belong to the table of row {}", column_id, row_id),
            ));
        }
        Ok(())
    }

    fn row_ids_of(&self, table_id: TableId) -> HashSet<RowId> {
        self.rows
            .values()
            .filter(|r| r.table_id == table_id)
            .map(|r| r.id)
            .collect()
    }

    fn remove_cells<F>(&mut self, predicate: F) -> u64
    where
        F: Fn(&Cell) -> bool,
    {
        let doomed: Vec<Cell> = self.cells.values().filter(|c| predicate(c)).cloned().collect();
        for cell in &doomed {
            self.cells.remove(&cell.id);
            self.cell_index.remove(&(cell.row_id, cell.column_id));
        }
        doomed.len() as u64
    }

    fn cells_of_column(&self, column_id: ColumnId) -> Vec<Cell> {
        self.cells
            .values()
            .filter(|c| c.column_id == column_id)
            .cloned()
            .collect()
    }
}

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// Where an injected fault fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    Begin,
    Commit,
    Mutation(MutationKind),
}

#[derive(Debug)]
struct Fault {
    point: FaultPoint,
    error: StorageError,
    skip: usize,
    remaining: usize,
}

// ============================================================================
// STORE
// ============================================================================

#[derive(Debug)]
struct Shared {
    state: RwLock<StoreState>,
    pool: Arc<Semaphore>,
    faults: Mutex<Vec<Fault>>,
    begun: AtomicU64,
    committed: AtomicU64,
}

impl Shared {
    fn read_state<R>(&self, f: impl FnOnce(&StoreState) -> R) -> TabulaResult<R> {
        let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(f(&state))
    }

    fn take_fault(&self, point: FaultPoint) -> Option<StorageError> {
        let mut faults = self.faults.lock().ok()?;
        let idx = faults.iter().position(|f| f.point == point)?;
        let fault = &mut faults[idx];
        if fault.skip > 0 {
            fault.skip -= 1;
            return None;
        }
        let error = fault.error.clone();
        fault.remaining -= 1;
        if fault.remaining == 0 {
            faults.remove(idx);
        }
        Some(error)
    }
}

/// Snapshot of committed record counts, mostly for assertions in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub tenants: usize,
    pub users: usize,
    pub sessions: usize,
    pub accounts: usize,
    pub databases: usize,
    pub tables: usize,
    pub columns: usize,
    pub rows: usize,
    pub cells: usize,
    pub permissions: usize,
}

/// In-memory implementation of [`RelationalStore`].
///
/// Every transaction gets snapshot-plus-replay semantics whatever
/// [`IsolationLevel`] it asks for. The level is recorded and reported by
/// [`StoreTransaction::isolation_level`] but does not change visibility:
/// reads never see concurrent commits, and conflicts surface at commit.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create an empty store with the default connection pool size.
    pub fn new() -> Self {
        Self::with_pool_size(DEFAULT_POOL_SIZE)
    }

    /// Create an empty store allowing `pool_size` concurrent transactions.
    pub fn with_pool_size(pool_size: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(StoreState::default()),
                pool: Arc::new(Semaphore::new(pool_size.max(1))),
                faults: Mutex::new(Vec::new()),
                begun: AtomicU64::new(0),
                committed: AtomicU64::new(0),
            }),
        }
    }

    /// Make the next `times` occurrences of `point` fail with `error`.
    pub fn inject_fault(&self, point: FaultPoint, error: StorageError, times: usize) {
        self.inject_fault_after(point, 0, error, times);
    }

    /// Let `skip` occurrences of `point` pass, then fail the next `times`.
    pub fn inject_fault_after(
        &self,
        point: FaultPoint,
        skip: usize,
        error: StorageError,
        times: usize,
    ) {
        if times == 0 {
            return;
        }
        if let Ok(mut faults) = self.shared.faults.lock() {
            faults.push(Fault {
                point,
                error,
                skip,
                remaining: times,
            });
        }
    }

    /// Remove all pending injected faults.
    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.shared.faults.lock() {
            faults.clear();
        }
    }

    /// Number of transactions opened so far.
    pub fn transactions_begun(&self) -> u64 {
        self.shared.begun.load(Ordering::Relaxed)
    }

    /// Number of transactions committed so far.
    pub fn transactions_committed(&self) -> u64 {
        self.shared.committed.load(Ordering::Relaxed)
    }

    /// Connections currently free in the pool.
    pub fn available_connections(&self) -> usize {
        self.shared.pool.available_permits()
    }

    /// Committed record counts.
    pub fn counts(&self) -> TabulaResult<StoreCounts> {
        self.shared.read_state(|s| StoreCounts {
            tenants: s.tenants.len(),
            users: s.users.len(),
            sessions: s.sessions.len(),
            accounts: s.accounts.len(),
            databases: s.databases.len(),
            tables: s.tables.len(),
            columns: s.columns.len(),
            rows: s.rows.len(),
            cells: s.cells.len(),
            permissions: s.permissions.len(),
        })
    }
}

fn sample_cells(cells: Vec<Cell>, limit: usize, strategy: SamplingStrategy) -> Vec<Cell> {
    match strategy {
        SamplingStrategy::Positional => cells.into_iter().take(limit).collect(),
        SamplingStrategy::Random => {
            let mut rng = rand::rng();
            let mut sample = cells.into_iter().choose_multiple(&mut rng, limit);
            sample.sort_by_key(|c| c.id);
            sample
        }
    }
}

#[async_trait]
impl RelationalStore for InMemoryStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self, isolation: IsolationLevel) -> TabulaResult<Self::Tx> {
        if let Some(error) = self.shared.take_fault(FaultPoint::Begin) {
            return Err(error.into());
        }
        let permit = Arc::clone(&self.shared.pool)
            .acquire_owned()
            .await
            .map_err(|_| StorageError::ConnectionLost {
                detail: "connection pool closed".to_string(),
            })?;
        let working = self.shared.read_state(|s| s.clone())?;
        self.shared.begun.fetch_add(1, Ordering::Relaxed);

        Ok(InMemoryTransaction {
            inner: Arc::new(Mutex::new(TxInner {
                working,
                journal: Vec::new(),
                status: TxStatus::Active,
                permit: Some(permit),
            })),
            shared: Arc::clone(&self.shared),
            isolation,
        })
    }

    async fn tenant_get(&self, id: TenantId) -> TabulaResult<Option<Tenant>> {
        self.shared.read_state(|s| s.tenants.get(&id).cloned())
    }

    async fn user_get(&self, id: UserId) -> TabulaResult<Option<User>> {
        self.shared.read_state(|s| s.users.get(&id).cloned())
    }

    async fn database_get(&self, id: DatabaseId) -> TabulaResult<Option<Database>> {
        self.shared.read_state(|s| s.databases.get(&id).cloned())
    }

    async fn table_get(&self, id: TableId) -> TabulaResult<Option<Table>> {
        self.shared.read_state(|s| s.tables.get(&id).cloned())
    }

    async fn column_get(&self, id: ColumnId) -> TabulaResult<Option<Column>> {
        self.shared.read_state(|s| s.columns.get(&id).cloned())
    }

    async fn column_list_by_table(&self, table_id: TableId) -> TabulaResult<Vec<Column>> {
        self.shared.read_state(|s| {
            let mut columns: Vec<Column> = s
                .columns
                .values()
                .filter(|c| c.table_id == table_id)
                .cloned()
                .collect();
            columns.sort_by_key(|c| (c.order, c.id));
            columns
        })
    }

    async fn row_get(&self, id: RowId) -> TabulaResult<Option<Row>> {
        self.shared.read_state(|s| s.rows.get(&id).cloned())
    }

    async fn row_list_by_table(
        &self,
        table_id: TableId,
        limit: Option<usize>,
    ) -> TabulaResult<Vec<Row>> {
        self.shared.read_state(|s| {
            s.rows
                .values()
                .filter(|r| r.table_id == table_id)
                .take(limit.unwrap_or(usize::MAX))
                .cloned()
                .collect()
        })
    }

    async fn row_count_by_table(&self, table_id: TableId) -> TabulaResult<u64> {
        self.shared
            .read_state(|s| s.rows.values().filter(|r| r.table_id == table_id).count() as u64)
    }

    async fn cell_list_by_row(&self, row_id: RowId) -> TabulaResult<Vec<Cell>> {
        self.shared.read_state(|s| {
            s.cells
                .values()
                .filter(|c| c.row_id == row_id)
                .cloned()
                .collect()
        })
    }

    async fn cell_count_by_column(&self, column_id: ColumnId) -> TabulaResult<u64> {
        self.shared
            .read_state(|s| s.cells.values().filter(|c| c.column_id == column_id).count() as u64)
    }

    async fn cell_sample_by_column(
        &self,
        column_id: ColumnId,
        limit: usize,
        strategy: SamplingStrategy,
    ) -> TabulaResult<Vec<Cell>> {
        let cells = self.shared.read_state(|s| s.cells_of_column(column_id))?;
        Ok(sample_cells(cells, limit, strategy))
    }

    async fn permission_list_by_table(&self, table_id: TableId) -> TabulaResult<Vec<Permission>> {
        self.shared.read_state(|s| {
            s.permissions
                .values()
                .filter(|p| p.table_id == table_id)
                .cloned()
                .collect()
        })
    }
}

// ============================================================================
// TRANSACTION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxStatus {
    Active,
    /// A statement failed; only rollback is accepted.
    Failed,
    Committed,
    RolledBack,
}

#[derive(Debug)]
struct TxInner {
    working: StoreState,
    /// Applied writes with the count each one reported.
    journal: Vec<(Mutation, u64)>,
    status: TxStatus,
    permit: Option<OwnedSemaphorePermit>,
}

impl TxInner {
    fn ensure_active(&self) -> TabulaResult<()> {
        match self.status {
            TxStatus::Active => Ok(()),
            TxStatus::Failed => Err(aborted_error()),
            TxStatus::Committed | TxStatus::RolledBack => {
                Err(StorageError::TransactionClosed.into())
            }
        }
    }

    fn finish(&mut self, status: TxStatus) {
        self.status = status;
        self.journal.clear();
        self.permit = None;
    }
}

fn aborted_error() -> TabulaError {
    StorageError::from_sqlstate(
        "25P02",
        "current transaction is aborted, commands ignored until end of transaction block",
    )
    .into()
}

/// Transaction handle of [`InMemoryStore`].
#[derive(Debug, Clone)]
pub struct InMemoryTransaction {
    inner: Arc<Mutex<TxInner>>,
    shared: Arc<Shared>,
    isolation: IsolationLevel,
}

impl InMemoryTransaction {
    fn lock(&self) -> TabulaResult<MutexGuard<'_, TxInner>> {
        self.inner
            .lock()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    fn read<R>(&self, f: impl FnOnce(&StoreState) -> R) -> TabulaResult<R> {
        let inner = self.lock()?;
        inner.ensure_active()?;
        Ok(f(&inner.working))
    }

    fn write(&self, mutation: Mutation) -> TabulaResult<u64> {
        let mut inner = self.lock()?;
        inner.ensure_active()?;

        let result = match self.shared.take_fault(FaultPoint::Mutation(mutation.kind())) {
            Some(error) => Err(error.into()),
            None => inner.working.apply(&mutation),
        };
        match result {
            Ok(affected) => {
                inner.journal.push((mutation, affected));
                Ok(affected)
            }
            Err(e) => {
                inner.status = TxStatus::Failed;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    async fn user_get(&self, id: UserId) -> TabulaResult<Option<User>> {
        self.read(|s| s.users.get(&id).cloned())
    }

    async fn table_get(&self, id: TableId) -> TabulaResult<Option<Table>> {
        self.read(|s| s.tables.get(&id).cloned())
    }

    async fn column_get(&self, id: ColumnId) -> TabulaResult<Option<Column>> {
        self.read(|s| s.columns.get(&id).cloned())
    }

    async fn row_get(&self, id: RowId) -> TabulaResult<Option<Row>> {
        self.read(|s| s.rows.get(&id).cloned())
    }

    async fn cell_list_by_column(&self, column_id: ColumnId) -> TabulaResult<Vec<Cell>> {
        self.read(|s| s.cells_of_column(column_id))
    }

    async fn tenant_insert(&self, tenant: &Tenant) -> TabulaResult<()> {
        self.write(Mutation::InsertTenant(tenant.clone())).map(|_| ())
    }

    async fn user_insert(&self, user: &User) -> TabulaResult<()> {
        self.write(Mutation::InsertUser(user.clone())).map(|_| ())
    }

    async fn session_insert(&self, session: &Session) -> TabulaResult<()> {
        self.write(Mutation::InsertSession(session.clone())).map(|_| ())
    }

    async fn account_insert(&self, account: &Account) -> TabulaResult<()> {
        self.write(Mutation::InsertAccount(account.clone())).map(|_| ())
    }

    async fn database_insert(&self, database: &Database) -> TabulaResult<()> {
        self.write(Mutation::InsertDatabase(database.clone())).map(|_| ())
    }

    async fn table_insert(&self, table: &Table) -> TabulaResult<()> {
        self.write(Mutation::InsertTable(table.clone())).map(|_| ())
    }

    async fn column_insert(&self, column: &Column) -> TabulaResult<()> {
        self.write(Mutation::InsertColumn(column.clone())).map(|_| ())
    }

    async fn permission_insert(&self, permission: &Permission) -> TabulaResult<()> {
        self.write(Mutation::InsertPermission(permission.clone())).map(|_| ())
    }

    async fn row_insert(&self, row: &Row) -> TabulaResult<()> {
        self.write(Mutation::InsertRow(row.clone())).map(|_| ())
    }

    async fn cell_insert(&self, cell: &Cell) -> TabulaResult<()> {
        self.write(Mutation::InsertCell(cell.clone())).map(|_| ())
    }

    async fn cell_upsert(
        &self,
        row_id: RowId,
        column_id: ColumnId,
        value: CellValue,
    ) -> TabulaResult<Cell> {
        let prepared = self.read(|s| {
            s.cell_index
                .get(&(row_id, column_id))
                .and_then(|id| s.cells.get(id))
                .map(|existing| Cell {
                    value: value.clone(),
                    ..existing.clone()
                })
        })?;
        let cell = prepared.unwrap_or_else(|| Cell::new(row_id, column_id, value));
        self.write(Mutation::UpsertCell(cell.clone()))?;
        Ok(cell)
    }

    async fn cell_update_value(&self, cell: &Cell) -> TabulaResult<()> {
        self.write(Mutation::UpdateCellValue(cell.clone())).map(|_| ())
    }

    async fn row_touch(&self, row_id: RowId, at: Timestamp) -> TabulaResult<()> {
        self.write(Mutation::TouchRow { row_id, at }).map(|_| ())
    }

    async fn column_set_type(
        &self,
        column_id: ColumnId,
        column_type: ColumnType,
    ) -> TabulaResult<()> {
        self.write(Mutation::SetColumnType {
            column_id,
            column_type,
        })
        .map(|_| ())
    }

    async fn cell_delete(&self, row_id: RowId, column_id: ColumnId) -> TabulaResult<u64> {
        self.write(Mutation::DeleteCell { row_id, column_id })
    }

    async fn cell_delete_by_row(&self, row_id: RowId) -> TabulaResult<u64> {
        self.write(Mutation::DeleteCellsByRow(row_id))
    }

    async fn cell_delete_by_table(&self, table_id: TableId) -> TabulaResult<u64> {
        self.write(Mutation::DeleteCellsByTable(table_id))
    }

    async fn row_delete(&self, row_id: RowId) -> TabulaResult<u64> {
        self.write(Mutation::DeleteRow(row_id))
    }

    async fn row_delete_by_table(&self, table_id: TableId) -> TabulaResult<u64> {
        self.write(Mutation::DeleteRowsByTable(table_id))
    }

    async fn column_delete_by_table(&self, table_id: TableId) -> TabulaResult<u64> {
        self.write(Mutation::DeleteColumnsByTable(table_id))
    }

    async fn permission_delete_by_table(&self, table_id: TableId) -> TabulaResult<u64> {
        self.write(Mutation::DeletePermissionsByTable(table_id))
    }

    async fn permission_delete_by_user(&self, user_id: UserId) -> TabulaResult<u64> {
        self.write(Mutation::DeletePermissionsByUser(user_id))
    }

    async fn session_delete_by_user(&self, user_id: UserId) -> TabulaResult<u64> {
        self.write(Mutation::DeleteSessionsByUser(user_id))
    }

    async fn account_delete_by_user(&self, user_id: UserId) -> TabulaResult<u64> {
        self.write(Mutation::DeleteAccountsByUser(user_id))
    }

    async fn table_delete(&self, table_id: TableId) -> TabulaResult<u64> {
        self.write(Mutation::DeleteTable(table_id))
    }

    async fn user_delete(&self, user_id: UserId) -> TabulaResult<u64> {
        self.write(Mutation::DeleteUser(user_id))
    }

    async fn commit(&self) -> TabulaResult<()> {
        let mut inner = self.lock()?;
        match inner.status {
            TxStatus::Active => {}
            TxStatus::Failed => {
                inner.finish(TxStatus::RolledBack);
                return Err(aborted_error());
            }
            TxStatus::Committed | TxStatus::RolledBack => {
                return Err(StorageError::TransactionClosed.into());
            }
        }

        if let Some(error) = self.shared.take_fault(FaultPoint::Commit) {
            inner.finish(TxStatus::RolledBack);
            return Err(error.into());
        }

        let replayed = {
            let mut live = self
                .shared
                .state
                .write()
                .map_err(|_| StorageError::LockPoisoned)?;
            let mut candidate = live.clone();
            let conflict = inner.journal.iter().find_map(|(m, recorded)| match candidate.apply(m) {
                Err(e) => Some((m.kind(), e.to_string())),
                Ok(affected) if m.reports_count() && affected != *recorded => Some((
                    m.kind(),
                    format!("now affects {} records, {} when written", affected, recorded),
                )),
                Ok(_) => None,
            });
            match conflict {
                Some((kind, e)) => Err(StorageError::SerializationFailure {
                    detail: format!("{:?} conflicts with a concurrent commit: {}", kind, e),
                }),
                None => {
                    *live = candidate;
                    Ok(())
                }
            }
        };

        match replayed {
            Ok(()) => {
                inner.finish(TxStatus::Committed);
                self.shared.committed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                inner.finish(TxStatus::RolledBack);
                Err(e.into())
            }
        }
    }

    async fn rollback(&self) -> TabulaResult<()> {
        let mut inner = self.lock()?;
        match inner.status {
            TxStatus::Active | TxStatus::Failed => {
                inner.finish(TxStatus::RolledBack);
                Ok(())
            }
            TxStatus::Committed | TxStatus::RolledBack => {
                Err(StorageError::TransactionClosed.into())
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
