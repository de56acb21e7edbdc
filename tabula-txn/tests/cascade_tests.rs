//! Cascading writes against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use tabula_core::{
    CacheConfig, CellValue, ColumnId, ColumnType, EntityIdType, EntityType, ErrorKind, RetryConfig,
    StorageError, TenantId, UserRole,
};
use tabula_schema::StandardConversionRules;
use tabula_storage::{
    CacheEntity, CacheKeys, CacheLayer, CacheStrategy, FaultPoint, InMemoryStore, MutationKind,
    RelationalStore, StoreTransaction,
};
use tabula_test_utils::assertions::{assert_kind, assert_row_absent};
use tabula_test_utils::fixtures::TableFixture;
use tabula_test_utils::init_test_tracing;
use tabula_txn::{TenantBootstrap, TransactionManager, DEFAULT_DATABASE_NAME};

const CONTACT_COLUMNS: [ColumnType; 3] = [ColumnType::Text, ColumnType::Number, ColumnType::Boolean];

fn manager(fixture: &TableFixture) -> TransactionManager<InMemoryStore> {
    TransactionManager::new(Arc::clone(&fixture.store))
}

fn contact(fixture: &TableFixture, name: &str, age: f64, active: bool) -> Vec<(ColumnId, CellValue)> {
    vec![
        (fixture.column(0).id, CellValue::text(name)),
        (fixture.column(1).id, CellValue::Number(age)),
        (fixture.column(2).id, CellValue::Bool(active)),
    ]
}

#[tokio::test]
async fn test_create_row_with_cells_commits_everything() {
    init_test_tracing();
    let fixture = TableFixture::new(&CONTACT_COLUMNS).await;
    let manager = manager(&fixture);

    let result = manager
        .create_row_with_cells(fixture.tenant.id, fixture.table.id, contact(&fixture, "Ana", 31.0, true))
        .await;

    assert!(result.success, "{:?}", result.error);
    let created = result.data.unwrap();
    assert_eq!(created.cells.len(), 3);
    let stored = fixture.store.cell_list_by_row(created.row.id).await.unwrap();
    assert_eq!(stored.len(), 3);
    assert_eq!(fixture.store.row_count_by_table(fixture.table.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_create_row_skips_null_cells() {
    let fixture = TableFixture::new(&CONTACT_COLUMNS).await;
    let cells = vec![
        (fixture.column(0).id, CellValue::text("Ana")),
        (fixture.column(1).id, CellValue::Null),
    ];

    let created = manager(&fixture)
        .create_row_with_cells(fixture.tenant.id, fixture.table.id, cells)
        .await
        .into_result()
        .unwrap();

    assert_eq!(created.cells.len(), 1);
}

#[tokio::test]
async fn test_failed_cell_insert_leaves_no_row() {
    let fixture = TableFixture::new(&CONTACT_COLUMNS).await;
    fixture.store.inject_fault_after(
        FaultPoint::Mutation(MutationKind::InsertCell),
        1,
        StorageError::Backend {
            code: "XX000".to_string(),
            message: "disk full".to_string(),
        },
        1,
    );

    let result = manager(&fixture)
        .create_row_with_cells(fixture.tenant.id, fixture.table.id, contact(&fixture, "Ana", 31.0, true))
        .await;

    assert!(!result.success);
    assert!(result.data.is_none());
    assert!(result.rollback_reason.is_some());
    assert_eq!(result.error.as_ref().map(|e| e.kind()), Some(ErrorKind::Internal));
    assert_eq!(fixture.store.row_count_by_table(fixture.table.id).await.unwrap(), 0);
    assert_eq!(fixture.store.counts().unwrap().cells, 0);
}

#[tokio::test]
async fn test_unknown_column_rolls_back_row() {
    let fixture = TableFixture::new(&CONTACT_COLUMNS).await;
    let cells = vec![
        (fixture.column(0).id, CellValue::text("Ana")),
        (ColumnId::now_v7(), CellValue::Number(1.0)),
    ];

    let result = manager(&fixture)
        .create_row_with_cells(fixture.tenant.id, fixture.table.id, cells)
        .await;

    assert_kind(&result.into_result(), ErrorKind::Integrity);
    assert_eq!(fixture.store.counts().unwrap().rows, 0);
}

#[tokio::test]
async fn test_foreign_tenant_is_rejected() {
    let fixture = TableFixture::new(&CONTACT_COLUMNS).await;
    let manager = manager(&fixture);
    fixture.insert_rows(vec![vec![CellValue::text("Ana")]]).await;

    let result = manager.delete_table_cascade(TenantId::now_v7(), fixture.table.id).await;

    assert_kind(&result.into_result(), ErrorKind::Validation);
    assert!(fixture.store.table_get(fixture.table.id).await.unwrap().is_some());
    assert_eq!(fixture.store.counts().unwrap().cells, 1);
}

#[tokio::test]
async fn test_update_row_upserts_and_clears_cells() {
    let fixture = TableFixture::new(&CONTACT_COLUMNS).await;
    let manager = manager(&fixture);
    let row_id = manager
        .create_row_with_cells(
            fixture.tenant.id,
            fixture.table.id,
            vec![
                (fixture.column(0).id, CellValue::text("Ana")),
                (fixture.column(1).id, CellValue::Number(31.0)),
            ],
        )
        .await
        .into_result()
        .unwrap()
        .row
        .id;

    let updated = manager
        .update_row_with_cells(
            fixture.tenant.id,
            row_id,
            vec![
                (fixture.column(0).id, CellValue::text("Ana Maria")),
                (fixture.column(1).id, CellValue::Null),
                (fixture.column(2).id, CellValue::Bool(false)),
            ],
        )
        .await
        .into_result()
        .unwrap();

    assert_eq!(updated.cells.len(), 2);
    let mut stored: Vec<CellValue> = fixture
        .store
        .cell_list_by_row(row_id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.value)
        .collect();
    stored.sort_by_key(|v| v.stable_key());
    let mut expected = vec![CellValue::text("Ana Maria"), CellValue::Bool(false)];
    expected.sort_by_key(|v| v.stable_key());
    assert_eq!(stored, expected);
}

#[tokio::test]
async fn test_update_missing_row_is_not_found() {
    let fixture = TableFixture::new(&CONTACT_COLUMNS).await;
    let result = manager(&fixture)
        .update_row_with_cells(fixture.tenant.id, tabula_core::RowId::now_v7(), Vec::new())
        .await;
    tabula_test_utils::assertions::assert_not_found(&result.into_result(), EntityType::Row);
}

#[tokio::test]
async fn test_delete_row_with_cells() {
    let fixture = TableFixture::new(&CONTACT_COLUMNS).await;
    let rows = fixture
        .insert_rows(vec![
            vec![CellValue::text("Ana"), CellValue::Number(1.0), CellValue::Bool(true)],
            vec![CellValue::text("Ion"), CellValue::Number(2.0), CellValue::Bool(false)],
        ])
        .await;

    let deleted = manager(&fixture)
        .delete_row_with_cells(fixture.tenant.id, rows[0])
        .await
        .into_result()
        .unwrap();

    assert_eq!(deleted, 3);
    assert_row_absent(&fixture.store, rows[0]).await;
    assert_eq!(fixture.store.cell_list_by_row(rows[1]).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_delete_table_cascade_counts() {
    init_test_tracing();
    let fixture = TableFixture::new(&CONTACT_COLUMNS).await;
    let rows: Vec<Vec<CellValue>> = (0..10)
        .map(|i| {
            vec![
                CellValue::text(format!("contact {}", i)),
                CellValue::Number(i as f64),
                CellValue::Bool(i % 2 == 0),
            ]
        })
        .collect();
    let row_ids = fixture.insert_rows(rows).await;
    fixture.attach_user_records().await;

    let deletion = manager(&fixture)
        .delete_table_cascade(fixture.tenant.id, fixture.table.id)
        .await
        .into_result()
        .unwrap();

    assert_eq!(deletion.deleted_cells, 30);
    assert_eq!(deletion.deleted_rows, 10);
    assert_eq!(deletion.deleted_columns, 3);
    assert_eq!(deletion.deleted_permissions, 1);
    assert!(fixture.store.table_get(fixture.table.id).await.unwrap().is_none());
    for row_id in row_ids {
        assert_row_absent(&fixture.store, row_id).await;
    }
    let counts = fixture.store.counts().unwrap();
    assert_eq!(counts.columns, 0);
    assert_eq!(counts.databases, 1);
}

#[tokio::test]
async fn test_delete_user_cascade() {
    let fixture = TableFixture::new(&CONTACT_COLUMNS).await;
    fixture.attach_user_records().await;

    let deletion = manager(&fixture)
        .delete_user_cascade(fixture.tenant.id, fixture.user.id)
        .await
        .into_result()
        .unwrap();

    assert_eq!(deletion.deleted_sessions, 1);
    assert_eq!(deletion.deleted_accounts, 1);
    assert_eq!(deletion.deleted_permissions, 1);
    assert!(fixture.store.user_get(fixture.user.id).await.unwrap().is_none());
    let counts = fixture.store.counts().unwrap();
    assert_eq!((counts.sessions, counts.accounts, counts.permissions), (0, 0, 0));
    assert_eq!(counts.tables, 1);
}

#[tokio::test]
async fn test_bulk_import_rows() {
    let fixture = TableFixture::new(&CONTACT_COLUMNS).await;
    let rows = (0..5)
        .map(|i| {
            vec![
                (fixture.column(0).id, CellValue::text(format!("row {}", i))),
                (fixture.column(1).id, CellValue::Number(i as f64)),
            ]
        })
        .collect();

    let import = manager(&fixture)
        .bulk_import_rows(fixture.tenant.id, fixture.table.id, rows)
        .await
        .into_result()
        .unwrap();

    assert_eq!(import.row_ids.len(), 5);
    assert_eq!(import.cells_imported, 10);
    assert_eq!(fixture.store.row_count_by_table(fixture.table.id).await.unwrap(), 5);
}

#[tokio::test]
async fn test_bulk_import_is_all_or_nothing() {
    let fixture = TableFixture::new(&CONTACT_COLUMNS).await;
    let mut rows: Vec<Vec<(ColumnId, CellValue)>> = (0..4)
        .map(|i| vec![(fixture.column(1).id, CellValue::Number(i as f64))])
        .collect();
    rows.push(vec![(ColumnId::now_v7(), CellValue::Number(99.0))]);

    let result = manager(&fixture)
        .bulk_import_rows(fixture.tenant.id, fixture.table.id, rows)
        .await;

    assert!(!result.success);
    assert_eq!(fixture.store.row_count_by_table(fixture.table.id).await.unwrap(), 0);
    assert_eq!(fixture.store.counts().unwrap().cells, 0);
}

#[tokio::test]
async fn test_bootstrap_tenant() {
    let store = Arc::new(InMemoryStore::new());
    let manager = TransactionManager::new(Arc::clone(&store));

    let created = manager
        .bootstrap_tenant(TenantBootstrap::new("Globex", "admin@globex.test").with_admin_name("Hank"))
        .await
        .into_result()
        .unwrap();

    assert_eq!(created.admin.role, UserRole::Admin);
    assert_eq!(created.admin.tenant_id, created.tenant.id);
    assert_eq!(created.admin.name.as_deref(), Some("Hank"));
    assert_eq!(created.database.name, DEFAULT_DATABASE_NAME);
    assert!(store.tenant_get(created.tenant.id).await.unwrap().is_some());
    assert!(store.user_get(created.admin.id).await.unwrap().is_some());
    assert!(store.database_get(created.database.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_bootstrap_rejects_bad_email() {
    let store = Arc::new(InMemoryStore::new());
    let manager = TransactionManager::new(Arc::clone(&store));

    let result = manager
        .bootstrap_tenant(TenantBootstrap::new("Globex", "not-an-email"))
        .await;

    assert_kind(&result.into_result(), ErrorKind::Validation);
    assert_eq!(store.counts().unwrap().tenants, 0);
}

#[tokio::test]
async fn test_bootstrap_failure_leaves_no_tenant() {
    let store = Arc::new(InMemoryStore::new());
    store.inject_fault(
        FaultPoint::Mutation(MutationKind::InsertDatabase),
        StorageError::ConnectionLost {
            detail: "reset by peer".to_string(),
        },
        1,
    );
    let manager = TransactionManager::new(Arc::clone(&store));

    let result = manager
        .bootstrap_tenant(TenantBootstrap::new("Globex", "admin@globex.test"))
        .await;

    assert!(result.is_retryable());
    let counts = store.counts().unwrap();
    assert_eq!((counts.tenants, counts.users, counts.databases), (0, 0, 0));
}

#[tokio::test]
async fn test_change_column_type_converts_cells() {
    let fixture = TableFixture::new(&[ColumnType::Text]).await;
    fixture
        .fill_column(0, vec![CellValue::text("1"), CellValue::text("$2,500"), CellValue::text("  ")])
        .await;
    let column_id = fixture.column(0).id;

    let migration = manager(&fixture)
        .change_column_type(fixture.tenant.id, column_id, ColumnType::Number, &StandardConversionRules)
        .await
        .into_result()
        .unwrap();

    assert_eq!(migration.old_type, ColumnType::Text);
    assert_eq!(migration.new_type, ColumnType::Number);
    assert_eq!(migration.converted_cells, 3);
    assert_eq!(migration.lossy_cells, 1);

    let column = fixture.store.column_get(column_id).await.unwrap().unwrap();
    assert_eq!(column.column_type, ColumnType::Number);
    let mut values: Vec<CellValue> = fixture
        .store
        .cell_sample_by_column(column_id, 10, Default::default())
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.value)
        .collect();
    values.sort_by_key(|v| v.stable_key());
    let mut expected = vec![CellValue::Number(1.0), CellValue::Number(2500.0), CellValue::Null];
    expected.sort_by_key(|v| v.stable_key());
    assert_eq!(values, expected);
}

#[tokio::test]
async fn test_change_column_type_counts_reinterpreted_cells_as_lossy() {
    let fixture = TableFixture::new(&[ColumnType::Number]).await;
    fixture
        .fill_column(0, vec![CellValue::Number(42.0), CellValue::Number(1999.0)])
        .await;

    let migration = manager(&fixture)
        .change_column_type(fixture.tenant.id, fixture.column(0).id, ColumnType::Date, &StandardConversionRules)
        .await
        .into_result()
        .unwrap();

    assert_eq!(migration.converted_cells, 2);
    assert_eq!(migration.lossy_cells, 2);
}

#[tokio::test]
async fn test_change_column_type_aborts_on_unconvertible_value() {
    let fixture = TableFixture::new(&[ColumnType::Text]).await;
    fixture
        .fill_column(0, vec![CellValue::text("1"), CellValue::text("abc")])
        .await;
    let column_id = fixture.column(0).id;

    let result = manager(&fixture)
        .change_column_type(fixture.tenant.id, column_id, ColumnType::Number, &StandardConversionRules)
        .await;

    assert_kind(&result.into_result(), ErrorKind::Conversion);
    let column = fixture.store.column_get(column_id).await.unwrap().unwrap();
    assert_eq!(column.column_type, ColumnType::Text);
    let sample = fixture
        .store
        .cell_sample_by_column(column_id, 10, Default::default())
        .await
        .unwrap();
    assert!(sample.iter().all(|c| matches!(c.value, CellValue::Text(_))));
}

#[tokio::test]
async fn test_writes_invalidate_cached_reads() {
    let fixture = TableFixture::new(&CONTACT_COLUMNS).await;
    let cache = Arc::new(CacheLayer::new(CacheConfig::default()));
    let manager = manager(&fixture).with_cache(Arc::clone(&cache));
    let tenant_id = fixture.tenant.id;

    let count_key = CacheKeys::row_count(tenant_id, fixture.table.id);
    let tenant_key = CacheKeys::tenant(tenant_id);
    cache.set(&count_key, &0u64, &CacheEntity::Count.default_strategy());
    cache.set(&tenant_key, &fixture.tenant, &CacheEntity::Tenant.default_strategy());
    cache.set(
        CacheKeys::columns(tenant_id, fixture.table.id),
        &fixture.columns,
        &CacheStrategy::seconds(600, 300),
    );

    manager
        .create_row_with_cells(tenant_id, fixture.table.id, contact(&fixture, "Ana", 31.0, true))
        .await
        .into_result()
        .unwrap();

    assert!(cache.get::<u64>(&count_key).is_none());
    assert!(cache.get::<tabula_core::Tenant>(&tenant_key).is_some());
    assert_eq!(cache.len(), 2);
}

#[tokio::test]
async fn test_row_delete_drops_only_that_tables_row_keys() {
    let fixture = TableFixture::new(&CONTACT_COLUMNS).await;
    let rows = fixture
        .insert_rows(vec![vec![CellValue::text("Ana"), CellValue::Number(31.0), CellValue::Bool(true)]])
        .await;
    let cache = Arc::new(CacheLayer::new(CacheConfig::default()));
    let manager = manager(&fixture).with_cache(Arc::clone(&cache));
    let tenant_id = fixture.tenant.id;

    let own_key = CacheKeys::row(tenant_id, fixture.table.id, rows[0]);
    let foreign_key = CacheKeys::row(tenant_id, tabula_core::TableId::now_v7(), rows[0]);
    let untagged = CacheStrategy::seconds(600, 300);
    cache.set(&own_key, &1u8, &untagged);
    cache.set(&foreign_key, &2u8, &untagged);

    manager
        .delete_row_with_cells(tenant_id, rows[0])
        .await
        .into_result()
        .unwrap();

    assert_eq!(cache.get::<u8>(&own_key), None);
    assert_eq!(cache.get::<u8>(&foreign_key), Some(2));
}

#[tokio::test]
async fn test_failed_write_keeps_cache() {
    let fixture = TableFixture::new(&CONTACT_COLUMNS).await;
    let cache = Arc::new(CacheLayer::new(CacheConfig::default()));
    let manager = manager(&fixture).with_cache(Arc::clone(&cache));
    let count_key = CacheKeys::row_count(fixture.tenant.id, fixture.table.id);
    cache.set(&count_key, &0u64, &CacheEntity::Count.default_strategy());

    let result = manager
        .create_row_with_cells(TenantId::now_v7(), fixture.table.id, Vec::new())
        .await;

    assert!(!result.success);
    assert_eq!(cache.get::<u64>(&count_key), Some(0));
}

#[tokio::test(start_paused = true)]
async fn test_retry_recovers_from_commit_conflicts() {
    let fixture = TableFixture::new(&CONTACT_COLUMNS).await;
    let manager = manager(&fixture).with_retry_config(RetryConfig {
        max_retries: 3,
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_secs(1),
        backoff_multiplier: 2.0,
    });
    fixture.store.inject_fault(
        FaultPoint::Commit,
        StorageError::SerializationFailure {
            detail: "could not serialize access".to_string(),
        },
        2,
    );
    let begun_before = fixture.store.transactions_begun();
    let table_id = fixture.table.id;

    let result = manager
        .execute_with_retry(
            |tx| async move {
                let row = tabula_core::Row::new(table_id);
                tx.row_insert(&row).await?;
                Ok(row.id)
            },
            3,
            &manager.default_options(),
        )
        .await;

    assert!(result.success, "{:?}", result.rollback_reason);
    assert_eq!(fixture.store.transactions_begun() - begun_before, 3);
    assert_eq!(fixture.store.row_count_by_table(table_id).await.unwrap(), 1);
}

mod properties {
    use super::*;
    use proptest::prelude::*;
    use tabula_test_utils::generators::arb_cell_value;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_bulk_import_counts_non_null_cells(
            rows in prop::collection::vec(prop::collection::vec(arb_cell_value(), 3), 0..12),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
            let expected_cells = rows.iter().flatten().filter(|v| !v.is_null()).count() as u64;
            let row_count = rows.len();

            let (import, stored_rows, stored_cells) = rt.block_on(async {
                let fixture = TableFixture::new(&CONTACT_COLUMNS).await;
                let input = rows
                    .into_iter()
                    .map(|values| {
                        fixture.columns.iter().map(|c| c.id).zip(values).collect::<Vec<_>>()
                    })
                    .collect();
                let import = manager(&fixture)
                    .bulk_import_rows(fixture.tenant.id, fixture.table.id, input)
                    .await
                    .into_result()
                    .unwrap();
                let stored_rows = fixture.store.row_count_by_table(fixture.table.id).await.unwrap();
                (import, stored_rows, fixture.store.counts().unwrap().cells as u64)
            });

            prop_assert_eq!(import.row_ids.len(), row_count);
            prop_assert_eq!(import.cells_imported, expected_cells);
            prop_assert_eq!(stored_rows, row_count as u64);
            prop_assert_eq!(stored_cells, expected_cells);
        }
    }
}
