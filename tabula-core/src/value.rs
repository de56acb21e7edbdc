//! Column types and the dynamically-typed cell value.

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// COLUMN TYPE
// ============================================================================

/// Declared scalar kind of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    /// Alias of [`ColumnType::Text`] kept for schemas created by older clients.
    String,
    Number,
    Integer,
    Boolean,
    Date,
    Json,
    Email,
    Url,
}

impl ColumnType {
    /// All column types, in declaration order.
    pub const ALL: [ColumnType; 9] = [
        ColumnType::Text,
        ColumnType::String,
        ColumnType::Number,
        ColumnType::Integer,
        ColumnType::Boolean,
        ColumnType::Date,
        ColumnType::Json,
        ColumnType::Email,
        ColumnType::Url,
    ];

    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::String => "string",
            ColumnType::Number => "number",
            ColumnType::Integer => "integer",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::Json => "json",
            ColumnType::Email => "email",
            ColumnType::Url => "url",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, ColumnTypeParseError> {
        match s.trim().to_lowercase().as_str() {
            "text" => Ok(ColumnType::Text),
            "string" => Ok(ColumnType::String),
            "number" => Ok(ColumnType::Number),
            "integer" => Ok(ColumnType::Integer),
            "boolean" => Ok(ColumnType::Boolean),
            "date" => Ok(ColumnType::Date),
            "json" => Ok(ColumnType::Json),
            "email" => Ok(ColumnType::Email),
            "url" => Ok(ColumnType::Url),
            _ => Err(ColumnTypeParseError(s.to_string())),
        }
    }

    /// Canonical representative of the type's alias class.
    pub fn canonical(&self) -> ColumnType {
        match self {
            ColumnType::String => ColumnType::Text,
            other => *other,
        }
    }

    /// True when both types store values identically (same type or alias pair).
    pub fn is_equivalent(&self, other: ColumnType) -> bool {
        self.canonical() == other.canonical()
    }

    /// True for types whose cells hold free text.
    pub fn is_textual(&self) -> bool {
        matches!(
            self,
            ColumnType::Text | ColumnType::String | ColumnType::Email | ColumnType::Url
        )
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for ColumnType {
    type Err = ColumnTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an unknown column type name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown column type: {0}")]
pub struct ColumnTypeParseError(pub String);

// ============================================================================
// CELL VALUE
// ============================================================================

/// Value held by a single cell.
///
/// The variant is expected to match the owning column's [`ColumnType`]; that
/// is checked at write time by conversion rules, not continuously.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Date(Timestamp),
    Json(serde_json::Value),
}

impl CellValue {
    pub fn text(s: impl Into<String>) -> Self {
        CellValue::Text(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Null, or text that is empty after trimming.
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Null => true,
            CellValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Short name of the variant, used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            CellValue::Null => "null",
            CellValue::Bool(_) => "bool",
            CellValue::Number(_) => "number",
            CellValue::Text(_) => "text",
            CellValue::Date(_) => "date",
            CellValue::Json(_) => "json",
        }
    }

    /// Deterministic serialization used to deduplicate values.
    ///
    /// JSON objects serialize with sorted keys, so structurally equal values
    /// always produce the same key.
    pub fn stable_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => f.write_str("null"),
            CellValue::Bool(b) => write!(f, "{}", b),
            CellValue::Number(n) => write!(f, "{}", n),
            CellValue::Text(s) => write!(f, "{:?}", s),
            CellValue::Date(d) => write!(f, "{}", d.to_rfc3339()),
            CellValue::Json(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        CellValue::Bool(b)
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

impl From<i64> for CellValue {
    fn from(n: i64) -> Self {
        CellValue::Number(n as f64)
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::Text(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_text_string_alias() {
        assert!(ColumnType::Text.is_equivalent(ColumnType::String));
        assert!(ColumnType::String.is_equivalent(ColumnType::Text));
        assert!(!ColumnType::Text.is_equivalent(ColumnType::Email));
        assert!(ColumnType::Number.is_equivalent(ColumnType::Number));
    }

    #[test]
    fn test_column_type_parse_is_case_insensitive() {
        assert_eq!("Number".parse::<ColumnType>().unwrap(), ColumnType::Number);
        assert_eq!(" url ".parse::<ColumnType>().unwrap(), ColumnType::Url);
        assert!("currency".parse::<ColumnType>().is_err());
    }

    #[test]
    fn test_empty_detection() {
        assert!(CellValue::Null.is_empty());
        assert!(CellValue::text("   ").is_empty());
        assert!(!CellValue::text("x").is_empty());
        assert!(!CellValue::Number(0.0).is_empty());
    }

    #[test]
    fn test_stable_key_sorts_json_keys() {
        let a = CellValue::Json(serde_json::json!({"b": 1, "a": 2}));
        let b = CellValue::Json(serde_json::json!({"a": 2, "b": 1}));
        assert_eq!(a.stable_key(), b.stable_key());
    }

    proptest! {
        #[test]
        fn prop_column_type_db_str_roundtrip(idx in 0usize..ColumnType::ALL.len()) {
            let ty = ColumnType::ALL[idx];
            prop_assert_eq!(ColumnType::from_db_str(ty.as_db_str()).unwrap(), ty);
        }

        #[test]
        fn prop_equivalence_is_symmetric(a in 0usize..9, b in 0usize..9) {
            let (a, b) = (ColumnType::ALL[a], ColumnType::ALL[b]);
            prop_assert_eq!(a.is_equivalent(b), b.is_equivalent(a));
        }
    }
}
