//! Core type definitions for Arkive.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Unique identifier for a transaction.
///
/// Transaction IDs are drawn at random from the positive 63-bit range so
/// they fit a signed 64-bit database column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Largest valid transaction id.
    pub const MAX: u64 = i64::MAX as u64;

    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Draws a random id in `1..=MAX`.
    #[must_use]
    pub fn random() -> Self {
        use rand::Rng;
        Self(rand::thread_rng().gen_range(1..=Self::MAX))
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().trim_start_matches("txn:");
        raw.parse().map(Self)
    }
}

/// Identifier of a repository resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(pub u64);

impl ResourceId {
    /// Creates a new resource ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res:{}", self.0)
    }
}

macro_rules! sql_id {
    ($ty:ident) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                let raw = i64::try_from(self.0)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                Ok(ToSqlOutput::from(raw))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let raw = i64::column_result(value)?;
                u64::try_from(raw)
                    .map($ty)
                    .map_err(|_| FromSqlError::OutOfRange(raw))
            }
        }
    };
}

sql_id!(TransactionId);
sql_id!(ResourceId);

/// Wall-clock time in milliseconds since the Unix epoch, as stored in the
/// `transactions` table.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Age of a stored millisecond timestamp relative to now.
#[must_use]
pub fn age_of(timestamp_millis: i64) -> Duration {
    let delta = now_millis().saturating_sub(timestamp_millis).max(0);
    Duration::from_millis(delta.unsigned_abs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_positive_63_bit() {
        for _ in 0..1000 {
            let id = TransactionId::random();
            assert!(id.as_u64() >= 1);
            assert!(id.as_u64() <= TransactionId::MAX);
        }
    }

    #[test]
    fn transaction_id_parse_and_display() {
        let id: TransactionId = "42\n".parse().unwrap();
        assert_eq!(id, TransactionId::new(42));
        assert_eq!(format!("{id}"), "txn:42");
        assert_eq!("txn:42".parse::<TransactionId>().unwrap(), id);
        assert!("abc".parse::<TransactionId>().is_err());
    }

    #[test]
    fn resource_id_display() {
        assert_eq!(format!("{}", ResourceId::new(7)), "res:7");
    }

    #[test]
    fn age_is_never_negative() {
        assert_eq!(age_of(now_millis() + 60_000), Duration::ZERO);
        assert!(age_of(now_millis() - 2_000) >= Duration::from_millis(2_000));
    }
}
