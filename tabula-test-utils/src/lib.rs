//! Tabula Test Utilities
//!
//! Shared test infrastructure for the Tabula workspace:
//! - Tracing setup that writes through the test harness
//! - Seeded in-memory store fixtures
//! - Proptest generators for values and column types
//! - Assertions on the error taxonomy

pub use tabula_core::{
    Account, AccountId, Cell, CellValue, Column, ColumnId, ColumnType, Database, EntityIdType,
    EntityType, ErrorKind, IsolationLevel, Row, RowId, Session, SessionId, StorageError, Table,
    TabulaError, TabulaResult, Tenant, User, UserId, UserRole, ValidationError,
};
pub use tabula_storage::{InMemoryStore, RelationalStore, StoreTransaction};

use std::sync::Arc;

/// Install a fmt subscriber honoring `RUST_LOG`, once per test binary.
///
/// Output goes through the test writer so it is captured per test.
pub fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built store contents for common testing scenarios.

    use super::*;
    use chrono::Utc;

    /// One tenant with an admin, a database and a table with the given columns,
    /// committed to a fresh [`InMemoryStore`].
    pub struct TableFixture {
        pub store: Arc<InMemoryStore>,
        pub tenant: Tenant,
        pub user: User,
        pub database: Database,
        pub table: Table,
        pub columns: Vec<Column>,
    }

    impl TableFixture {
        pub async fn new(column_types: &[ColumnType]) -> Self {
            Self::with_store(Arc::new(InMemoryStore::new()), column_types).await
        }

        pub async fn with_store(store: Arc<InMemoryStore>, column_types: &[ColumnType]) -> Self {
            let tenant = Tenant::new("acme");
            let user = User::new(tenant.id, "owner@acme.test", UserRole::Admin);
            let database = Database::new(tenant.id, "Default");
            let table = Table::new(tenant.id, database.id, "contacts");
            let columns: Vec<Column> = column_types
                .iter()
                .enumerate()
                .map(|(i, ty)| Column::new(table.id, format!("col_{}", i), *ty, i as i32))
                .collect();

            let tx = store
                .begin(IsolationLevel::ReadCommitted)
                .await
                .expect("begin fixture transaction");
            tx.tenant_insert(&tenant).await.expect("insert tenant");
            tx.user_insert(&user).await.expect("insert user");
            tx.database_insert(&database).await.expect("insert database");
            tx.table_insert(&table).await.expect("insert table");
            for column in &columns {
                tx.column_insert(column).await.expect("insert column");
            }
            tx.commit().await.expect("commit fixture");

            Self {
                store,
                tenant,
                user,
                database,
                table,
                columns,
            }
        }

        pub fn column(&self, index: usize) -> &Column {
            &self.columns[index]
        }

        /// Insert rows, one per entry, with one cell per non-null value.
        /// Values are matched to columns by position.
        pub async fn insert_rows(&self, rows: Vec<Vec<CellValue>>) -> Vec<RowId> {
            let tx = self
                .store
                .begin(IsolationLevel::ReadCommitted)
                .await
                .expect("begin insert transaction");
            let mut ids = Vec::with_capacity(rows.len());
            for values in rows {
                let row = Row::new(self.table.id);
                tx.row_insert(&row).await.expect("insert row");
                for (column, value) in self.columns.iter().zip(values) {
                    if value.is_null() {
                        continue;
                    }
                    tx.cell_insert(&Cell::new(row.id, column.id, value))
                        .await
                        .expect("insert cell");
                }
                ids.push(row.id);
            }
            tx.commit().await.expect("commit rows");
            ids
        }

        /// Insert one row per value, filling only the column at `index`.
        pub async fn fill_column(&self, index: usize, values: Vec<CellValue>) -> Vec<RowId> {
            let width = self.columns.len();
            let rows = values
                .into_iter()
                .map(|value| {
                    let mut row = vec![CellValue::Null; width];
                    row[index] = value;
                    row
                })
                .collect();
            self.insert_rows(rows).await
        }

        /// Give the admin a session, a linked account and full rights on the table.
        pub async fn attach_user_records(&self) {
            let tx = self
                .store
                .begin(IsolationLevel::ReadCommitted)
                .await
                .expect("begin user records transaction");
            tx.session_insert(&Session {
                id: SessionId::now_v7(),
                user_id: self.user.id,
                expires_at: Utc::now() + chrono::Duration::hours(1),
            })
            .await
            .expect("insert session");
            tx.account_insert(&Account {
                id: AccountId::now_v7(),
                user_id: self.user.id,
                provider: "github".to_string(),
            })
            .await
            .expect("insert account");
            tx.permission_insert(&tabula_core::Permission::full(self.table.id, self.user.id))
                .await
                .expect("insert permission");
            tx.commit().await.expect("commit user records");
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Tabula values.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_column_type() -> impl Strategy<Value = ColumnType> {
        prop::sample::select(ColumnType::ALL.to_vec())
    }

    /// Any finite number.
    pub fn arb_number() -> impl Strategy<Value = f64> {
        prop::num::f64::NORMAL | prop::num::f64::ZERO
    }

    /// Text that no standard rule parses as a number, boolean or date.
    pub fn arb_word() -> impl Strategy<Value = String> {
        "[g-z]{3,12}"
    }

    pub fn arb_cell_value() -> impl Strategy<Value = CellValue> {
        prop_oneof![
            Just(CellValue::Null),
            any::<bool>().prop_map(CellValue::Bool),
            arb_number().prop_map(CellValue::Number),
            "[a-zA-Z0-9 .,@:/-]{0,40}".prop_map(CellValue::Text),
            (0i64..4_000_000_000).prop_map(|secs| {
                CellValue::Date(
                    chrono::DateTime::from_timestamp(secs, 0).unwrap_or_default(),
                )
            }),
            any::<i32>().prop_map(|n| CellValue::Json(serde_json::json!({ "n": n }))),
        ]
    }

    pub fn arb_column_id() -> impl Strategy<Value = ColumnId> {
        any::<u128>().prop_map(|n| ColumnId::new(uuid::Uuid::from_u128(n)))
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on the error taxonomy.

    use super::*;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &TabulaResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    #[track_caller]
    pub fn assert_kind<T: std::fmt::Debug>(result: &TabulaResult<T>, kind: ErrorKind) {
        match result {
            Err(err) => assert_eq!(err.kind(), kind, "Wrong error kind for {:?}", err),
            Ok(v) => panic!("Expected {:?} error, got Ok({:?})", kind, v),
        }
    }

    /// Assert a validation-level NotFound for the given entity type.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &TabulaResult<T>, entity_type: EntityType) {
        match result {
            Err(TabulaError::Validation(ValidationError::NotFound { entity_type: et, .. }))
            | Err(TabulaError::Storage(StorageError::NotFound { entity_type: et, .. })) => {
                assert_eq!(*et, entity_type, "Wrong entity type in NotFound error");
            }
            other => panic!("Expected NotFound error for {:?}, got: {:?}", entity_type, other),
        }
    }

    /// Assert the store holds no row and no cell for `row_id`.
    pub async fn assert_row_absent(store: &InMemoryStore, row_id: RowId) {
        let row = store.row_get(row_id).await.expect("read row");
        assert!(row.is_none(), "row {} should not exist", row_id);
        let cells = store.cell_list_by_row(row_id).await.expect("read cells");
        assert!(cells.is_empty(), "row {} still has {} cells", row_id, cells.len());
    }
}
