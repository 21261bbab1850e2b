//! Transaction state.

use crate::types::{age_of, TransactionId};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use std::fmt;
use std::time::Duration;

/// State of a registered transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Transaction accepts work.
    Active,
    /// The client asked for a commit; the coordinator will finalize it.
    Commit,
    /// The client asked for a rollback; the coordinator will finalize it.
    Rollback,
}

impl TransactionState {
    /// Returns the database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TransactionState::Active => "active",
            TransactionState::Commit => "commit",
            TransactionState::Rollback => "rollback",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TransactionState::Active),
            "commit" => Some(TransactionState::Commit),
            "rollback" => Some(TransactionState::Rollback),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for TransactionState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TransactionState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        Self::parse(text).ok_or_else(|| FromSqlError::Other(format!("bad state {text}").into()))
    }
}

/// A row of the `transactions` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    /// Transaction id.
    pub id: TransactionId,
    /// Registration time, milliseconds since the Unix epoch.
    pub started: i64,
    /// Last heartbeat, milliseconds since the Unix epoch.
    pub last_request: i64,
    /// Current state.
    pub state: TransactionState,
}

impl TransactionRecord {
    /// Returns how long ago the last heartbeat happened.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        age_of(self.last_request)
    }

    /// Returns true if the transaction is active but idle beyond `timeout`.
    #[must_use]
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.state == TransactionState::Active && self.idle_for() > timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_millis;

    #[test]
    fn state_names() {
        for state in [
            TransactionState::Active,
            TransactionState::Commit,
            TransactionState::Rollback,
        ] {
            assert_eq!(TransactionState::parse(state.as_str()), Some(state));
        }
        assert_eq!(TransactionState::parse("pending"), None);
    }

    #[test]
    fn expiry_only_applies_to_active() {
        let mut record = TransactionRecord {
            id: TransactionId::new(1),
            started: now_millis() - 10_000,
            last_request: now_millis() - 10_000,
            state: TransactionState::Active,
        };
        assert!(record.is_expired(Duration::from_secs(1)));
        assert!(!record.is_expired(Duration::from_secs(60)));

        record.state = TransactionState::Commit;
        assert!(!record.is_expired(Duration::from_secs(1)));
    }
}
