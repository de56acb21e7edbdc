//! Error types for Tabula operations
//!
//! The storage layer reports failures as a closed [`StorageError`] enum; the
//! transaction manager decides whether to retry by switching on
//! [`TabulaError::kind`], never by matching message text.

use crate::{ColumnType, EntityType};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Coarse classification used by retry and reporting logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller misuse: missing entity, bad argument, bad pattern.
    Validation,
    /// Deadlock or serialization failure. Retryable.
    Conflict,
    /// Store unreachable or connection dropped. Retryable.
    Connectivity,
    /// A time bound was exceeded. Retryable once.
    Timeout,
    /// Unique or foreign-key constraint rejected the write.
    Integrity,
    /// A value could not be represented under the target column type.
    Conversion,
    Config,
    /// Anything the store could not classify.
    Internal,
}

impl ErrorKind {
    /// Transient failures that are safe to retry after a rollback.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Conflict | ErrorKind::Connectivity | ErrorKind::Timeout
        )
    }
}

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {entity_type:?} with id {id}")]
    NotFound { entity_type: EntityType, id: Uuid },

    #[error("Unique constraint {constraint} violated: {detail}")]
    UniqueViolation { constraint: String, detail: String },

    #[error("Foreign key constraint {constraint} violated: {detail}")]
    ForeignKeyViolation { constraint: String, detail: String },

    #[error("Deadlock detected: {detail}")]
    Deadlock { detail: String },

    #[error("Could not serialize access: {detail}")]
    SerializationFailure { detail: String },

    #[error("Connection lost: {detail}")]
    ConnectionLost { detail: String },

    #[error("Statement timed out: {detail}")]
    StatementTimeout { detail: String },

    #[error("Lock not available: {detail}")]
    LockNotAvailable { detail: String },

    #[error("Transaction is already committed or rolled back")]
    TransactionClosed,

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Backend error ({code}): {message}")]
    Backend { code: String, message: String },
}

impl StorageError {
    /// Map a PostgreSQL SQLSTATE code to a storage error.
    ///
    /// Codes outside the enumerated set become [`StorageError::Backend`] and
    /// are never retried.
    pub fn from_sqlstate(code: &str, message: impl Into<String>) -> Self {
        let detail = message.into();
        match code {
            "40P01" => StorageError::Deadlock { detail },
            "40001" => StorageError::SerializationFailure { detail },
            "08000" | "08001" | "08003" | "08004" | "08006" | "08007" | "57P01" | "57P02"
            | "57P03" => StorageError::ConnectionLost { detail },
            "57014" => StorageError::StatementTimeout { detail },
            "55P03" => StorageError::LockNotAvailable { detail },
            "23505" => StorageError::UniqueViolation {
                constraint: "unique".to_string(),
                detail,
            },
            "23503" => StorageError::ForeignKeyViolation {
                constraint: "foreign_key".to_string(),
                detail,
            },
            other => StorageError::Backend {
                code: other.to_string(),
                message: detail,
            },
        }
    }

    pub fn not_found(entity_type: EntityType, id: impl Into<Uuid>) -> Self {
        StorageError::NotFound {
            entity_type,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotFound { .. } => ErrorKind::Validation,
            StorageError::UniqueViolation { .. } | StorageError::ForeignKeyViolation { .. } => {
                ErrorKind::Integrity
            }
            StorageError::Deadlock { .. } | StorageError::SerializationFailure { .. } => {
                ErrorKind::Conflict
            }
            StorageError::ConnectionLost { .. } => ErrorKind::Connectivity,
            StorageError::StatementTimeout { .. } | StorageError::LockNotAvailable { .. } => {
                ErrorKind::Timeout
            }
            StorageError::TransactionClosed
            | StorageError::LockPoisoned
            | StorageError::Backend { .. } => ErrorKind::Internal,
        }
    }
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("{entity_type:?} {id} not found")]
    NotFound { entity_type: EntityType, id: Uuid },

    #[error("{entity_type:?} {id} does not belong to tenant {tenant_id}")]
    TenantMismatch {
        entity_type: EntityType,
        id: Uuid,
        tenant_id: Uuid,
    },

    #[error("Constraint violation on {constraint}: {reason}")]
    ConstraintViolation { constraint: String, reason: String },
}

/// A bound on transaction acquisition or execution was exceeded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TimeoutError {
    #[error("Timed out after {waited:?} waiting for a transaction slot")]
    AcquireTransaction { waited: Duration },

    #[error("Transaction exceeded its {limit:?} timeout")]
    TransactionBody { limit: Duration },
}

/// A single value could not be represented under a new column type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Cannot convert {value} from {from} to {to}: {reason}")]
pub struct ConversionError {
    pub from: ColumnType,
    pub to: ColumnType,
    pub value: String,
    pub reason: String,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all Tabula errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TabulaError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Timeout: {0}")]
    Timeout(#[from] TimeoutError),

    #[error("Conversion error: {0}")]
    Conversion(#[from] ConversionError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl TabulaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TabulaError::Storage(e) => e.kind(),
            TabulaError::Validation(_) => ErrorKind::Validation,
            TabulaError::Timeout(_) => ErrorKind::Timeout,
            TabulaError::Conversion(_) => ErrorKind::Conversion,
            TabulaError::Config(_) => ErrorKind::Config,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

/// Result type alias for Tabula operations.
pub type TabulaResult<T> = Result<T, TabulaError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_classification() {
        assert_eq!(StorageError::from_sqlstate("40P01", "x").kind(), ErrorKind::Conflict);
        assert_eq!(StorageError::from_sqlstate("40001", "x").kind(), ErrorKind::Conflict);
        assert_eq!(StorageError::from_sqlstate("08006", "x").kind(), ErrorKind::Connectivity);
        assert_eq!(StorageError::from_sqlstate("57014", "x").kind(), ErrorKind::Timeout);
        assert_eq!(StorageError::from_sqlstate("23505", "x").kind(), ErrorKind::Integrity);
        assert_eq!(StorageError::from_sqlstate("42P01", "x").kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_retryable_kinds() {
        let deadlock: TabulaError = StorageError::Deadlock {
            detail: "tuple".to_string(),
        }
        .into();
        assert!(deadlock.is_retryable());

        let timeout: TabulaError = TimeoutError::TransactionBody {
            limit: Duration::from_secs(5),
        }
        .into();
        assert!(timeout.is_retryable());
        assert!(timeout.is_timeout());

        let missing: TabulaError = ValidationError::NotFound {
            entity_type: EntityType::Row,
            id: Uuid::nil(),
        }
        .into();
        assert!(!missing.is_retryable());

        let fk: TabulaError = StorageError::from_sqlstate("23503", "cell_column_fk").into();
        assert!(!fk.is_retryable());
    }

    #[test]
    fn test_storage_error_display_not_found() {
        let err = StorageError::not_found(EntityType::Table, Uuid::nil());
        let msg = format!("{}", err);
        assert!(msg.contains("Entity not found"));
        assert!(msg.contains("Table"));
        assert!(msg.contains("00000000-0000-0000-0000-000000000000"));
    }

    #[test]
    fn test_conversion_error_display() {
        let err = ConversionError {
            from: ColumnType::Text,
            to: ColumnType::Number,
            value: "\"abc\"".to_string(),
            reason: "not numeric".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("text"));
        assert!(msg.contains("number"));
        assert!(msg.contains("not numeric"));
    }
}
