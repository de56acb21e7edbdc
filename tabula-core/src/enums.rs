//! Enum types shared across crates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity type discriminator for the relational schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Tenant,
    User,
    Session,
    Account,
    Database,
    Table,
    Column,
    Row,
    Cell,
    Permission,
}

impl EntityType {
    /// Lowercase name used in cache keys and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Tenant => "tenant",
            EntityType::User => "user",
            EntityType::Session => "session",
            EntityType::Account => "account",
            EntityType::Database => "database",
            EntityType::Table => "table",
            EntityType::Column => "column",
            EntityType::Row => "row",
            EntityType::Cell => "cell",
            EntityType::Permission => "permission",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction isolation level requested from the relational store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling of the isolation level.
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}
