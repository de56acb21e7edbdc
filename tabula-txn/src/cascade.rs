//! Cascading operations over the dynamic schema.
//!
//! Each operation is a single [`TransactionManager::execute`] call, so it
//! either applies completely or not at all. Successful operations drop the
//! cache entries they made stale.

use chrono::Utc;
use tabula_core::{
    Cell, CellValue, ColumnId, ColumnType, ConversionError, Database, EntityIdType, EntityType,
    Row, RowId, TableId, TabulaResult, Tenant, TenantId, User, UserId, UserRole, ValidationError,
};
use tabula_schema::ConversionRules;
use tabula_storage::{CacheEntity, CacheKeys, RelationalStore, StoreTransaction};

use crate::manager::TransactionManager;
use crate::result::TransactionResult;

/// Name given to the database created for a new tenant when none is given.
pub const DEFAULT_DATABASE_NAME: &str = "Default";

/// Values for one row, keyed by column.
pub type CellInput = Vec<(ColumnId, CellValue)>;

/// A row together with the cells written for it.
#[derive(Debug, Clone, PartialEq)]
pub struct RowWithCells {
    pub row: Row,
    pub cells: Vec<Cell>,
}

/// Records removed by [`TransactionManager::delete_table_cascade`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableDeletion {
    pub deleted_cells: u64,
    pub deleted_rows: u64,
    pub deleted_columns: u64,
    pub deleted_permissions: u64,
}

/// Records removed by [`TransactionManager::delete_user_cascade`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserDeletion {
    pub deleted_sessions: u64,
    pub deleted_accounts: u64,
    pub deleted_permissions: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BulkImport {
    pub row_ids: Vec<RowId>,
    pub cells_imported: u64,
}

/// Input for [`TransactionManager::bootstrap_tenant`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantBootstrap {
    pub tenant_name: String,
    pub admin_email: String,
    pub admin_name: Option<String>,
    pub database_name: String,
}

impl TenantBootstrap {
    pub fn new(tenant_name: impl Into<String>, admin_email: impl Into<String>) -> Self {
        Self {
            tenant_name: tenant_name.into(),
            admin_email: admin_email.into(),
            admin_name: None,
            database_name: DEFAULT_DATABASE_NAME.to_string(),
        }
    }

    pub fn with_admin_name(mut self, name: impl Into<String>) -> Self {
        self.admin_name = Some(name.into());
        self
    }

    pub fn with_database_name(mut self, name: impl Into<String>) -> Self {
        self.database_name = name.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BootstrappedTenant {
    pub tenant: Tenant,
    pub admin: User,
    pub database: Database,
}

/// Result of [`TransactionManager::change_column_type`].
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMigration {
    pub column_id: ColumnId,
    pub old_type: ColumnType,
    pub new_type: ColumnType,
    pub converted_cells: u64,
    /// Cells whose new value does not exactly preserve the old one.
    pub lossy_cells: u64,
}

/// Cache entries to drop after a successful write.
#[derive(Default)]
struct Invalidation {
    keys: Vec<String>,
    patterns: Vec<String>,
    entities: Vec<CacheEntity>,
}

fn not_found(entity_type: EntityType, id: impl EntityIdType) -> ValidationError {
    ValidationError::NotFound {
        entity_type,
        id: id.as_uuid(),
    }
}

fn tenant_mismatch(entity_type: EntityType, id: impl EntityIdType, tenant_id: TenantId) -> ValidationError {
    ValidationError::TenantMismatch {
        entity_type,
        id: id.as_uuid(),
        tenant_id: tenant_id.as_uuid(),
    }
}

/// Load a table and check it belongs to `tenant_id`.
async fn owned_table<T: StoreTransaction>(
    tx: &T,
    tenant_id: TenantId,
    table_id: TableId,
) -> TabulaResult<tabula_core::Table> {
    let table = tx
        .table_get(table_id)
        .await?
        .ok_or_else(|| not_found(EntityType::Table, table_id))?;
    if table.tenant_id != tenant_id {
        return Err(tenant_mismatch(EntityType::Table, table_id, tenant_id).into());
    }
    Ok(table)
}

/// Load a row and check its table belongs to `tenant_id`.
async fn owned_row<T: StoreTransaction>(tx: &T, tenant_id: TenantId, row_id: RowId) -> TabulaResult<Row> {
    let row = tx
        .row_get(row_id)
        .await?
        .ok_or_else(|| not_found(EntityType::Row, row_id))?;
    owned_table(tx, tenant_id, row.table_id).await?;
    Ok(row)
}

async fn insert_row<T: StoreTransaction>(tx: &T, table_id: TableId, cells: CellInput) -> TabulaResult<RowWithCells> {
    let row = Row::new(table_id);
    tx.row_insert(&row).await?;

    let mut written = Vec::with_capacity(cells.len());
    for (column_id, value) in cells {
        if value.is_null() {
            continue;
        }
        let cell = Cell::new(row.id, column_id, value);
        tx.cell_insert(&cell).await?;
        written.push(cell);
    }
    Ok(RowWithCells { row, cells: written })
}

impl<S: RelationalStore> TransactionManager<S> {
    fn invalidate(&self, invalidation: Invalidation) {
        let Some(cache) = self.cache() else {
            return;
        };
        for key in &invalidation.keys {
            cache.delete(key);
        }
        for pattern in &invalidation.patterns {
            if let Err(e) = cache.invalidate(pattern) {
                tracing::warn!(pattern = %pattern, error = %e, "Cache invalidation pattern rejected");
            }
        }
        let tags: Vec<&str> = invalidation.entities.iter().map(CacheEntity::as_str).collect();
        cache.invalidate_by_tags(&tags);
    }

    fn table_data_invalidation(tenant_id: TenantId, table_id: TableId) -> Invalidation {
        Invalidation {
            keys: vec![CacheKeys::row_count(tenant_id, table_id)],
            patterns: vec![
                CacheKeys::table_scope_pattern(CacheEntity::Row, tenant_id, table_id),
                CacheKeys::tenant_pattern(CacheEntity::Cell, tenant_id),
            ],
            entities: vec![CacheEntity::Row, CacheEntity::Cell, CacheEntity::Count],
        }
    }

    /// Insert a row and its cells. `Null` values are skipped.
    pub async fn create_row_with_cells(
        &self,
        tenant_id: TenantId,
        table_id: TableId,
        cells: CellInput,
    ) -> TransactionResult<RowWithCells> {
        let result = self
            .execute(
                |tx| async move {
                    owned_table(&tx, tenant_id, table_id).await?;
                    insert_row(&tx, table_id, cells).await
                },
                &self.default_options(),
            )
            .await;

        if let Some(created) = &result.data {
            tracing::info!(
                tenant_id = %tenant_id,
                table_id = %table_id,
                row_id = %created.row.id,
                cells = created.cells.len(),
                "Row created"
            );
            self.invalidate(Self::table_data_invalidation(tenant_id, table_id));
        }
        result
    }

    /// Upsert cells of an existing row. A `Null` value removes the cell.
    ///
    /// Returns the row and the cells that now hold the given values.
    pub async fn update_row_with_cells(
        &self,
        tenant_id: TenantId,
        row_id: RowId,
        cells: CellInput,
    ) -> TransactionResult<RowWithCells> {
        let result = self
            .execute(
                |tx| async move {
                    let mut row = owned_row(&tx, tenant_id, row_id).await?;

                    let mut written = Vec::with_capacity(cells.len());
                    for (column_id, value) in cells {
                        if value.is_null() {
                            tx.cell_delete(row_id, column_id).await?;
                        } else {
                            written.push(tx.cell_upsert(row_id, column_id, value).await?);
                        }
                    }

                    row.updated_at = Utc::now();
                    tx.row_touch(row_id, row.updated_at).await?;
                    Ok(RowWithCells { row, cells: written })
                },
                &self.default_options(),
            )
            .await;

        if let Some(updated) = &result.data {
            tracing::info!(tenant_id = %tenant_id, row_id = %row_id, cells = updated.cells.len(), "Row updated");
            let mut invalidation = Self::table_data_invalidation(tenant_id, updated.row.table_id);
            invalidation.keys.push(CacheKeys::cells(tenant_id, row_id));
            self.invalidate(invalidation);
        }
        result
    }

    /// Delete a row and its cells. Returns the number of cells removed.
    pub async fn delete_row_with_cells(&self, tenant_id: TenantId, row_id: RowId) -> TransactionResult<u64> {
        let result = self
            .execute(
                |tx| async move {
                    let row = owned_row(&tx, tenant_id, row_id).await?;
                    let cells = tx.cell_delete_by_row(row_id).await?;
                    tx.row_delete(row_id).await?;
                    Ok((row.table_id, cells))
                },
                &self.default_options(),
            )
            .await;

        if let Some((table_id, cells)) = result.data {
            tracing::info!(tenant_id = %tenant_id, row_id = %row_id, deleted_cells = cells, "Row deleted");
            self.invalidate(Self::table_data_invalidation(tenant_id, table_id));
        }
        result.map(|(_, cells)| cells)
    }

    /// Delete a table with everything under it.
    ///
    /// Removes cells, then rows, then columns, then permissions, then the
    /// table, and reports how many records each step removed. A concurrent
    /// commit that changes any of those counts fails this one with a
    /// conflict, so the reported counts are what was actually deleted.
    pub async fn delete_table_cascade(
        &self,
        tenant_id: TenantId,
        table_id: TableId,
    ) -> TransactionResult<TableDeletion> {
        let result = self
            .execute(
                |tx| async move {
                    let table = owned_table(&tx, tenant_id, table_id).await?;
                    let deletion = TableDeletion {
                        deleted_cells: tx.cell_delete_by_table(table_id).await?,
                        deleted_rows: tx.row_delete_by_table(table_id).await?,
                        deleted_columns: tx.column_delete_by_table(table_id).await?,
                        deleted_permissions: tx.permission_delete_by_table(table_id).await?,
                    };
                    tx.table_delete(table_id).await?;
                    Ok((table.database_id, deletion))
                },
                &self.default_options(),
            )
            .await;

        if let Some((database_id, deletion)) = result.data {
            tracing::info!(
                tenant_id = %tenant_id,
                table_id = %table_id,
                deleted_cells = deletion.deleted_cells,
                deleted_rows = deletion.deleted_rows,
                deleted_columns = deletion.deleted_columns,
                deleted_permissions = deletion.deleted_permissions,
                "Table deleted"
            );
            let mut invalidation = Self::table_data_invalidation(tenant_id, table_id);
            invalidation.keys.push(CacheKeys::table(tenant_id, database_id, table_id));
            invalidation.keys.push(CacheKeys::columns(tenant_id, table_id));
            invalidation.keys.push(CacheKeys::permissions(tenant_id, table_id));
            invalidation.patterns.push(CacheKeys::table_scope_pattern(CacheEntity::Column, tenant_id, table_id));
            invalidation.entities.extend([CacheEntity::Table, CacheEntity::Column, CacheEntity::Permission]);
            self.invalidate(invalidation);
        }
        result.map(|(_, deletion)| deletion)
    }

    /// Delete a user with its sessions, linked accounts and permissions.
    pub async fn delete_user_cascade(&self, tenant_id: TenantId, user_id: UserId) -> TransactionResult<UserDeletion> {
        let result = self
            .execute(
                |tx| async move {
                    let user = tx
                        .user_get(user_id)
                        .await?
                        .ok_or_else(|| not_found(EntityType::User, user_id))?;
                    if user.tenant_id != tenant_id {
                        return Err(tenant_mismatch(EntityType::User, user_id, tenant_id).into());
                    }
                    let deletion = UserDeletion {
                        deleted_sessions: tx.session_delete_by_user(user_id).await?,
                        deleted_accounts: tx.account_delete_by_user(user_id).await?,
                        deleted_permissions: tx.permission_delete_by_user(user_id).await?,
                    };
                    tx.user_delete(user_id).await?;
                    Ok(deletion)
                },
                &self.default_options(),
            )
            .await;

        if let Some(deletion) = &result.data {
            tracing::info!(
                tenant_id = %tenant_id,
                user_id = %user_id,
                deleted_sessions = deletion.deleted_sessions,
                deleted_accounts = deletion.deleted_accounts,
                deleted_permissions = deletion.deleted_permissions,
                "User deleted"
            );
            self.invalidate(Invalidation {
                keys: vec![CacheKeys::user(tenant_id, user_id)],
                patterns: vec![CacheKeys::tenant_pattern(CacheEntity::Permission, tenant_id)],
                entities: vec![CacheEntity::User, CacheEntity::Permission],
            });
        }
        result
    }

    /// Insert many rows in one transaction, one row at a time.
    ///
    /// Runs under the longer bulk-import timeout. There is no chunking, so
    /// very large imports may still exceed it and roll back as a whole.
    pub async fn bulk_import_rows(
        &self,
        tenant_id: TenantId,
        table_id: TableId,
        rows: Vec<CellInput>,
    ) -> TransactionResult<BulkImport> {
        let options = self
            .default_options()
            .with_timeout(self.config().bulk_import_timeout);
        let row_count = rows.len();

        let result = self
            .execute(
                |tx| async move {
                    owned_table(&tx, tenant_id, table_id).await?;
                    let mut import = BulkImport {
                        row_ids: Vec::with_capacity(rows.len()),
                        cells_imported: 0,
                    };
                    for cells in rows {
                        let created = insert_row(&tx, table_id, cells).await?;
                        import.cells_imported += created.cells.len() as u64;
                        import.row_ids.push(created.row.id);
                    }
                    Ok(import)
                },
                &options,
            )
            .await;

        match &result.data {
            Some(import) => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    table_id = %table_id,
                    rows = import.row_ids.len(),
                    cells = import.cells_imported,
                    "Bulk import committed"
                );
                self.invalidate(Self::table_data_invalidation(tenant_id, table_id));
            }
            None => {
                tracing::warn!(tenant_id = %tenant_id, table_id = %table_id, rows = row_count, "Bulk import rolled back");
            }
        }
        result
    }

    /// Create a tenant with its first admin user and a default database.
    pub async fn bootstrap_tenant(&self, request: TenantBootstrap) -> TransactionResult<BootstrappedTenant> {
        let result = self
            .execute(
                |tx| async move {
                    if request.tenant_name.trim().is_empty() {
                        return Err(ValidationError::RequiredFieldMissing {
                            field: "tenant_name".to_string(),
                        }
                        .into());
                    }
                    if !request.admin_email.contains('@') {
                        return Err(ValidationError::InvalidValue {
                            field: "admin_email".to_string(),
                            reason: format!("{:?} is not an email address", request.admin_email),
                        }
                        .into());
                    }

                    let tenant = Tenant::new(request.tenant_name);
                    tx.tenant_insert(&tenant).await?;

                    let mut admin = User::new(tenant.id, request.admin_email, UserRole::Admin);
                    admin.name = request.admin_name;
                    tx.user_insert(&admin).await?;

                    let database = Database::new(tenant.id, request.database_name);
                    tx.database_insert(&database).await?;

                    Ok(BootstrappedTenant { tenant, admin, database })
                },
                &self.default_options(),
            )
            .await;

        if let Some(created) = &result.data {
            tracing::info!(
                tenant_id = %created.tenant.id,
                admin_id = %created.admin.id,
                database_id = %created.database.id,
                "Tenant bootstrapped"
            );
            self.invalidate(Invalidation {
                entities: vec![CacheEntity::Tenant, CacheEntity::Count],
                ..Invalidation::default()
            });
        }
        result
    }

    /// Change a column's type, converting every stored cell.
    ///
    /// Null cells stay null and blank text becomes null under a non-text
    /// type. A single value the rules cannot convert aborts the whole
    /// change. Run the type-change analysis first to learn whether that is
    /// likely.
    pub async fn change_column_type<R: ConversionRules>(
        &self,
        tenant_id: TenantId,
        column_id: ColumnId,
        new_type: ColumnType,
        rules: &R,
    ) -> TransactionResult<ColumnMigration> {
        let result = self
            .execute(
                |tx| async move {
                    let column = tx
                        .column_get(column_id)
                        .await?
                        .ok_or_else(|| not_found(EntityType::Column, column_id))?;
                    owned_table(&tx, tenant_id, column.table_id).await?;

                    let old_type = column.column_type;
                    let mut migration = ColumnMigration {
                        column_id,
                        old_type,
                        new_type,
                        converted_cells: 0,
                        lossy_cells: 0,
                    };

                    if !old_type.is_equivalent(new_type) {
                        for mut cell in tx.cell_list_by_column(column_id).await? {
                            if cell.value.is_null() {
                                continue;
                            }
                            if cell.value.is_empty() {
                                if !new_type.is_textual() {
                                    cell.value = CellValue::Null;
                                    tx.cell_update_value(&cell).await?;
                                    migration.converted_cells += 1;
                                }
                                continue;
                            }

                            let outcome = rules.attempt_conversion(&cell.value, old_type, new_type);
                            if !outcome.success {
                                return Err(ConversionError {
                                    from: old_type,
                                    to: new_type,
                                    value: cell.value.to_string(),
                                    reason: outcome
                                        .error
                                        .unwrap_or_else(|| rules.conversion_description(old_type, new_type)),
                                }
                                .into());
                            }
                            if outcome.is_lossy() {
                                migration.lossy_cells += 1;
                            }
                            if let Some(value) = outcome.new_value {
                                if value != cell.value {
                                    cell.value = value;
                                    tx.cell_update_value(&cell).await?;
                                }
                            }
                            migration.converted_cells += 1;
                        }
                    }

                    tx.column_set_type(column_id, new_type).await?;
                    Ok((column.table_id, migration))
                },
                &self.default_options(),
            )
            .await;

        if let Some((table_id, migration)) = &result.data {
            tracing::info!(
                tenant_id = %tenant_id,
                column_id = %column_id,
                old_type = %migration.old_type,
                new_type = %migration.new_type,
                converted = migration.converted_cells,
                lossy = migration.lossy_cells,
                "Column type changed"
            );
            let mut invalidation = Self::table_data_invalidation(tenant_id, *table_id);
            invalidation.keys.push(CacheKeys::columns(tenant_id, *table_id));
            invalidation.keys.push(CacheKeys::column(tenant_id, *table_id, column_id));
            invalidation.entities.push(CacheEntity::Column);
            self.invalidate(invalidation);
        }
        result.map(|(_, migration)| migration)
    }
}
