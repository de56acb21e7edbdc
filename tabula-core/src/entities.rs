//! Core entity structures
//!
//! Mirrors the relational schema: tenant → database → table → column / row →
//! cell, plus the user, session, account and permission records that hang off
//! tenants and tables.

use crate::{
    AccountId, CellId, CellValue, ColumnId, ColumnType, DatabaseId, EntityIdType, PermissionId,
    RowId, SessionId, TableId, TenantId, Timestamp, UserId,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Tenant - isolation root for one customer organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub created_at: Timestamp,
}

impl Tenant {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TenantId::now_v7(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// Role of a user inside its tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Editor,
    #[default]
    Viewer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub tenant_id: TenantId,
    pub email: String,
    pub name: Option<String>,
    pub role: UserRole,
    pub created_at: Timestamp,
}

impl User {
    pub fn new(tenant_id: TenantId, email: impl Into<String>, role: UserRole) -> Self {
        Self {
            id: UserId::now_v7(),
            tenant_id,
            email: email.into(),
            name: None,
            role,
            created_at: Utc::now(),
        }
    }
}

/// Login session; removed together with its user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub expires_at: Timestamp,
}

/// Linked identity-provider account; removed together with its user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub user_id: UserId,
    pub provider: String,
}

/// Database - a tenant-owned container of tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Database {
    pub id: DatabaseId,
    pub tenant_id: TenantId,
    pub name: String,
    pub created_at: Timestamp,
}

impl Database {
    pub fn new(tenant_id: TenantId, name: impl Into<String>) -> Self {
        Self {
            id: DatabaseId::now_v7(),
            tenant_id,
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// Table - owns columns, rows and permission records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub id: TableId,
    pub database_id: DatabaseId,
    pub tenant_id: TenantId,
    pub name: String,
    pub created_at: Timestamp,
}

impl Table {
    pub fn new(tenant_id: TenantId, database_id: DatabaseId, name: impl Into<String>) -> Self {
        Self {
            id: TableId::now_v7(),
            database_id,
            tenant_id,
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// Column - declared type and display order of one field of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub id: ColumnId,
    pub table_id: TableId,
    pub name: String,
    pub column_type: ColumnType,
    /// Free-form semantic hint ("currency", "customer_name", ...).
    pub semantic_type: Option<String>,
    /// Display order within the table.
    pub order: i32,
}

impl Column {
    pub fn new(table_id: TableId, name: impl Into<String>, column_type: ColumnType, order: i32) -> Self {
        Self {
            id: ColumnId::now_v7(),
            table_id,
            name: name.into(),
            column_type,
            semantic_type: None,
            order,
        }
    }
}

/// Row - owns at most one cell per column (sparse).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: RowId,
    pub table_id: TableId,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Row {
    pub fn new(table_id: TableId) -> Self {
        let now = Utc::now();
        Self {
            id: RowId::now_v7(),
            table_id,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Cell - the atomic (row, column) value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub id: CellId,
    pub row_id: RowId,
    pub column_id: ColumnId,
    pub value: CellValue,
}

impl Cell {
    pub fn new(row_id: RowId, column_id: ColumnId, value: CellValue) -> Self {
        Self {
            id: CellId::now_v7(),
            row_id,
            column_id,
            value,
        }
    }
}

/// Per-table access grant for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub id: PermissionId,
    pub table_id: TableId,
    pub user_id: UserId,
    pub can_read: bool,
    pub can_edit: bool,
    pub can_delete: bool,
}

impl Permission {
    pub fn read_only(table_id: TableId, user_id: UserId) -> Self {
        Self {
            id: PermissionId::now_v7(),
            table_id,
            user_id,
            can_read: true,
            can_edit: false,
            can_delete: false,
        }
    }

    pub fn full(table_id: TableId, user_id: UserId) -> Self {
        Self {
            can_edit: true,
            can_delete: true,
            ..Self::read_only(table_id, user_id)
        }
    }
}
