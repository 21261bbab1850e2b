//! Resource lifecycle states.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use std::fmt;

/// Lifecycle state of a resource.
///
/// ```text
/// active --delete--> tombstone --delete tombstone--> deleted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Ordinary, readable resource.
    Active,
    /// Deleted, but metadata is kept; reads answer "gone".
    Tombstone,
    /// Terminal state; reads answer "not found".
    Deleted,
}

impl ResourceState {
    /// Returns the database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ResourceState::Active => "active",
            ResourceState::Tombstone => "tombstone",
            ResourceState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for ResourceState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ResourceState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "active" => Ok(ResourceState::Active),
            "tombstone" => Ok(ResourceState::Tombstone),
            "deleted" => Ok(ResourceState::Deleted),
            other => Err(FromSqlError::Other(format!("bad state {other}").into())),
        }
    }
}

/// Which lifecycle state a writer expects to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquireMode {
    /// Ordinary writes; tombstones are rejected as gone.
    #[default]
    Resource,
    /// Writes aimed at the tombstone itself; active resources are rejected
    /// as not found.
    Tombstone,
}
