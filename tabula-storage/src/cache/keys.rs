//! Cache key construction.
//!
//! Entity keys are `{entity}:{tenant}:...` so a single tenant-scoped pattern
//! can drop every entry of one entity class for a tenant. Read-through keys
//! are derived from a hash of the serialized query, so structurally equal
//! queries share an entry no matter where they are issued.

use sha2::{Digest, Sha256};
use serde::Serialize;
use tabula_core::{ColumnId, DatabaseId, RowId, TableId, TenantId, UserId};

use super::strategy::CacheEntity;

/// Number of hex characters of the query digest kept in a key.
const QUERY_DIGEST_LEN: usize = 16;

/// Read-through query shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryOp {
    FindOne,
    FindMany,
    Count,
}

impl QueryOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryOp::FindOne => "find_one",
            QueryOp::FindMany => "find_many",
            QueryOp::Count => "count",
        }
    }
}

/// Canonical cache keys and invalidation patterns.
pub struct CacheKeys;

impl CacheKeys {
    /// `{op}:{entity}:{digest}` for a read-through query.
    ///
    /// Map-typed query fields must serialize in a stable order (`BTreeMap`,
    /// `serde_json::Value`) for equal queries to produce equal keys.
    pub fn query<Q>(op: QueryOp, entity: CacheEntity, query: &Q) -> Result<String, serde_json::Error>
    where
        Q: Serialize + ?Sized,
    {
        let bytes = serde_json::to_vec(query)?;
        let digest = hex::encode(Sha256::digest(&bytes));
        Ok(format!(
            "{}:{}:{}",
            op.as_str(),
            entity.as_str(),
            &digest[..QUERY_DIGEST_LEN]
        ))
    }

    pub fn tenant(tenant_id: TenantId) -> String {
        format!("tenant:{}", tenant_id)
    }

    pub fn user(tenant_id: TenantId, user_id: UserId) -> String {
        format!("user:{}:{}", tenant_id, user_id)
    }

    pub fn table(tenant_id: TenantId, database_id: DatabaseId, table_id: TableId) -> String {
        format!("table:{}:{}:{}", tenant_id, database_id, table_id)
    }

    pub fn columns(tenant_id: TenantId, table_id: TableId) -> String {
        format!("column:{}:{}", tenant_id, table_id)
    }

    pub fn column(tenant_id: TenantId, table_id: TableId, column_id: ColumnId) -> String {
        format!("column:{}:{}:{}", tenant_id, table_id, column_id)
    }

    pub fn row(tenant_id: TenantId, table_id: TableId, row_id: RowId) -> String {
        format!("row:{}:{}:{}", tenant_id, table_id, row_id)
    }

    pub fn cells(tenant_id: TenantId, row_id: RowId) -> String {
        format!("cell:{}:{}", tenant_id, row_id)
    }

    pub fn permissions(tenant_id: TenantId, table_id: TableId) -> String {
        format!("permission:{}:{}", tenant_id, table_id)
    }

    pub fn row_count(tenant_id: TenantId, table_id: TableId) -> String {
        format!("count:{}:rows:{}", tenant_id, table_id)
    }

    /// Every key of `entity` belonging to `tenant_id`.
    pub fn tenant_pattern(entity: CacheEntity, tenant_id: TenantId) -> String {
        format!("{}:{}(:.*)?$", entity.as_str(), tenant_id)
    }

    /// Every key of `entity` scoped under one table.
    pub fn table_scope_pattern(entity: CacheEntity, tenant_id: TenantId, table_id: TableId) -> String {
        format!("{}:{}:{}(:.*)?$", entity.as_str(), tenant_id, table_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use serde_json::json;
    use tabula_core::EntityIdType;

    #[test]
    fn test_query_key_is_structural() {
        let a = CacheKeys::query(QueryOp::FindMany, CacheEntity::Row, &json!({"table": 1, "limit": 10}))
            .unwrap();
        let b = CacheKeys::query(QueryOp::FindMany, CacheEntity::Row, &json!({"limit": 10, "table": 1}))
            .unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("find_many:row:"));
        assert_eq!(a.len(), "find_many:row:".len() + QUERY_DIGEST_LEN);
    }

    #[test]
    fn test_query_key_differs_by_op_and_query() {
        let q = json!({"table": 1});
        let many = CacheKeys::query(QueryOp::FindMany, CacheEntity::Row, &q).unwrap();
        let count = CacheKeys::query(QueryOp::Count, CacheEntity::Row, &q).unwrap();
        let other = CacheKeys::query(QueryOp::FindMany, CacheEntity::Row, &json!({"table": 2})).unwrap();
        assert_ne!(many, count);
        assert_ne!(many, other);
    }

    #[test]
    fn test_table_scope_pattern_covers_only_that_table() {
        let tenant = TenantId::now_v7();
        let table = TableId::now_v7();
        let pattern = Regex::new(&format!(
            "^(?:{})",
            CacheKeys::table_scope_pattern(CacheEntity::Row, tenant, table)
        ))
        .unwrap();

        assert!(pattern.is_match(&CacheKeys::row(tenant, table, RowId::now_v7())));
        assert!(!pattern.is_match(&CacheKeys::row(tenant, TableId::now_v7(), RowId::now_v7())));
        assert!(!pattern.is_match(&CacheKeys::row_count(tenant, table)));
    }

    #[test]
    fn test_tenant_pattern_does_not_cross_tenants() {
        let tenant = TenantId::now_v7();
        let other = TenantId::now_v7();
        let pattern = Regex::new(&format!("^(?:{})", CacheKeys::tenant_pattern(CacheEntity::User, tenant))).unwrap();

        assert!(pattern.is_match(&CacheKeys::user(tenant, UserId::now_v7())));
        assert!(!pattern.is_match(&CacheKeys::user(other, UserId::now_v7())));
        assert!(!pattern.is_match(&CacheKeys::tenant(tenant)));
    }
}
