//! Identity types for Tabula entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Common behaviour of the strongly-typed entity identifiers.
///
/// UUIDv7 embeds a Unix timestamp, so freshly generated ids sort by creation
/// time. The in-memory store relies on this for stable row ordering.
pub trait EntityIdType:
    Copy + Eq + Ord + std::hash::Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Wrap a raw UUID.
    fn new(uuid: Uuid) -> Self;

    /// Get the underlying UUID.
    fn as_uuid(&self) -> Uuid;

    /// Generate a fresh timestamp-sortable id.
    fn now_v7() -> Self {
        Self::new(Uuid::now_v7())
    }

    /// The nil id, mostly useful in tests.
    fn nil() -> Self {
        Self::new(Uuid::nil())
    }
}

macro_rules! define_entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl EntityIdType for $name {
            fn new(uuid: Uuid) -> Self {
                Self(uuid)
            }

            fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_entity_id!(
    /// Identifier of a tenant (customer organization).
    TenantId
);
define_entity_id!(
    /// Identifier of a user inside a tenant.
    UserId
);
define_entity_id!(SessionId);
define_entity_id!(AccountId);
define_entity_id!(
    /// Identifier of a user-defined database.
    DatabaseId
);
define_entity_id!(TableId);
define_entity_id!(ColumnId);
define_entity_id!(RowId);
define_entity_id!(CellId);
define_entity_id!(PermissionId);
