//! Access to the `transactions` table.
//!
//! The table is the only shared bookkeeping of in-flight transactions. The
//! coordinator inserts and removes rows, request handlers refresh the
//! heartbeat and flip the state to `commit` or `rollback`.

use crate::error::{CoreError, CoreResult};
use crate::transaction::state::{TransactionRecord, TransactionState};
use crate::types::{now_millis, ResourceId, TransactionId};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::time::Duration;

const REGISTER_ATTEMPTS: usize = 8;

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<TransactionRecord> {
    Ok(TransactionRecord {
        id: row.get(0)?,
        started: row.get(1)?,
        last_request: row.get(2)?,
        state: row.get(3)?,
    })
}

/// Inserts a new active transaction with a random id.
///
/// # Errors
///
/// Returns an error if the insert fails for a reason other than an id
/// collision, or if every attempt collided.
pub fn register(conn: &Connection) -> CoreResult<TransactionRecord> {
    let mut last_err = None;
    for _ in 0..REGISTER_ATTEMPTS {
        let id = TransactionId::random();
        match insert(conn, id) {
            Ok(record) => return Ok(record),
            Err(CoreError::Database(rusqlite::Error::SqliteFailure(e, msg)))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                tracing::debug!(txid = %id, "transaction id collision, retrying");
                last_err = Some(rusqlite::Error::SqliteFailure(e, msg));
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.map_or_else(
        || CoreError::invalid_value("no transaction id could be allocated"),
        CoreError::from,
    ))
}

/// Inserts an active transaction with the given id.
///
/// # Errors
///
/// Returns an error if the id is taken or the insert fails.
pub fn insert(conn: &Connection, id: TransactionId) -> CoreResult<TransactionRecord> {
    let now = now_millis();
    conn.execute(
        "INSERT INTO transactions (transaction_id, started, last_request, state)
         VALUES (?1, ?2, ?2, 'active')",
        params![id, now],
    )?;
    Ok(TransactionRecord {
        id,
        started: now,
        last_request: now,
        state: TransactionState::Active,
    })
}

/// Reads a transaction row.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get(conn: &Connection, id: TransactionId) -> CoreResult<Option<TransactionRecord>> {
    let record = conn
        .query_row(
            "SELECT transaction_id, started, last_request, state
             FROM transactions WHERE transaction_id = ?1",
            [id],
            record_from_row,
        )
        .optional()?;
    Ok(record)
}

/// Lists all transaction rows.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list(conn: &Connection) -> CoreResult<Vec<TransactionRecord>> {
    let mut stmt = conn.prepare(
        "SELECT transaction_id, started, last_request, state
         FROM transactions ORDER BY started",
    )?;
    let rows = stmt.query_map([], record_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Lists transactions, in any state, whose last request is older than
/// `timeout`.
///
/// A supervised transaction leaves this list within one poll interval of
/// expiring, so rows that stay here have lost their worker.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn stale(conn: &Connection, timeout: Duration) -> CoreResult<Vec<TransactionRecord>> {
    let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
    let cutoff = now_millis().saturating_sub(timeout_ms);
    let mut stmt = conn.prepare(
        "SELECT transaction_id, started, last_request, state
         FROM transactions WHERE last_request < ?1 ORDER BY last_request",
    )?;
    let rows = stmt.query_map([cutoff], record_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Verifies that `id` is an active transaction and refreshes its heartbeat.
///
/// # Errors
///
/// Returns `UnknownTransaction` if there is no such row and
/// `BadTransactionState` if it is no longer active.
pub fn check_active(conn: &Connection, id: TransactionId) -> CoreResult<TransactionRecord> {
    let now = now_millis();
    let touched = conn.execute(
        "UPDATE transactions SET last_request = ?2
         WHERE transaction_id = ?1 AND state = 'active'",
        params![id, now],
    )?;
    match get(conn, id)? {
        Some(record) if touched == 1 && record.state == TransactionState::Active => Ok(record),
        Some(record) => Err(CoreError::bad_transaction_state(id, record.state)),
        None => Err(CoreError::unknown_transaction(id)),
    }
}

/// Builds the error for a write that found `id` no longer active.
pub(crate) fn rejection(conn: &Connection, id: TransactionId) -> CoreError {
    match get(conn, id) {
        Ok(Some(record)) => CoreError::bad_transaction_state(id, record.state),
        Ok(None) => CoreError::unknown_transaction(id),
        Err(e) => e,
    }
}

/// Asks the coordinator to finish `id` with the given state.
///
/// # Errors
///
/// Returns `UnknownTransaction` or `BadTransactionState` if `id` is not an
/// active transaction.
pub fn request(conn: &Connection, id: TransactionId, state: TransactionState) -> CoreResult<()> {
    let changed = conn.execute(
        "UPDATE transactions SET state = ?2, last_request = ?3
         WHERE transaction_id = ?1 AND state = 'active'",
        params![id, state, now_millis()],
    )?;
    if changed == 1 {
        tracing::debug!(txid = %id, %state, "transaction completion requested");
        return Ok(());
    }
    Err(rejection(conn, id))
}

/// Closes an active transaction to new requests by moving it to
/// `rollback`.
///
/// Returns the state the transaction ends up in: `Rollback` when the fence
/// took hold, the state a client already requested when it lost the race
/// (e.g. `Commit`), and `None` if the row is gone.
///
/// # Errors
///
/// Returns an error if the update or the follow-up read fails.
pub fn fence(conn: &Connection, id: TransactionId) -> CoreResult<Option<TransactionState>> {
    let changed = conn.execute(
        "UPDATE transactions SET state = 'rollback'
         WHERE transaction_id = ?1 AND state = 'active'",
        [id],
    )?;
    if changed == 1 {
        return Ok(Some(TransactionState::Rollback));
    }
    Ok(get(conn, id)?.map(|record| record.state))
}

/// Returns the ids of all resources owned by `id`.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn owned_resources(conn: &Connection, id: TransactionId) -> CoreResult<Vec<ResourceId>> {
    let mut stmt = conn.prepare("SELECT id FROM resources WHERE transaction_id = ?1 ORDER BY id")?;
    let rows = stmt.query_map([id], |row| row.get(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Removes the transaction row and clears every lock it still holds.
///
/// Returns the number of resources that were released.
///
/// # Errors
///
/// Returns an error if the cleanup transaction fails.
pub fn release(conn: &mut Connection, id: TransactionId) -> CoreResult<usize> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let released = tx.execute(
        "UPDATE resources SET transaction_id = NULL WHERE transaction_id = ?1",
        [id],
    )?;
    tx.execute("DELETE FROM transactions WHERE transaction_id = ?1", [id])?;
    tx.commit()?;
    Ok(released)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db;
    use tempfile::{tempdir, TempDir};

    fn open() -> (TempDir, Connection) {
        let dir = tempdir().unwrap();
        let conn = db::open(&DatabaseConfig::new(dir.path().join("db.sqlite"))).unwrap();
        (dir, conn)
    }

    #[test]
    fn register_and_get() {
        let (_dir, conn) = open();
        let record = register(&conn).unwrap();
        assert_eq!(record.state, TransactionState::Active);

        let stored = get(&conn, record.id).unwrap().unwrap();
        assert_eq!(stored, record);
        assert_eq!(list(&conn).unwrap().len(), 1);
    }

    #[test]
    fn duplicate_insert_fails() {
        let (_dir, conn) = open();
        insert(&conn, TransactionId::new(5)).unwrap();
        assert!(insert(&conn, TransactionId::new(5)).is_err());
    }

    #[test]
    fn check_active_refreshes_heartbeat() {
        let (_dir, conn) = open();
        let id = TransactionId::new(9);
        insert(&conn, id).unwrap();
        conn.execute(
            "UPDATE transactions SET last_request = 0 WHERE transaction_id = 9",
            [],
        )
        .unwrap();

        let record = check_active(&conn, id).unwrap();
        assert!(record.last_request > 0);
    }

    #[test]
    fn check_active_errors() {
        let (_dir, conn) = open();
        let err = check_active(&conn, TransactionId::new(1)).unwrap_err();
        assert!(matches!(err, CoreError::UnknownTransaction { .. }));

        insert(&conn, TransactionId::new(2)).unwrap();
        request(&conn, TransactionId::new(2), TransactionState::Commit).unwrap();
        let err = check_active(&conn, TransactionId::new(2)).unwrap_err();
        assert!(matches!(
            err,
            CoreError::BadTransactionState {
                state: TransactionState::Commit,
                ..
            }
        ));
    }

    #[test]
    fn request_only_from_active() {
        let (_dir, conn) = open();
        let id = TransactionId::new(3);
        insert(&conn, id).unwrap();
        request(&conn, id, TransactionState::Rollback).unwrap();
        assert!(matches!(
            request(&conn, id, TransactionState::Commit),
            Err(CoreError::BadTransactionState { .. })
        ));
        assert!(matches!(
            request(&conn, TransactionId::new(4), TransactionState::Commit),
            Err(CoreError::UnknownTransaction { .. })
        ));
    }

    #[test]
    fn fence_closes_active_and_keeps_requested_state() {
        let (_dir, conn) = open();
        let fenced = TransactionId::new(1);
        let committed = TransactionId::new(2);
        insert(&conn, fenced).unwrap();
        insert(&conn, committed).unwrap();
        request(&conn, committed, TransactionState::Commit).unwrap();

        assert_eq!(fence(&conn, fenced).unwrap(), Some(TransactionState::Rollback));
        assert!(matches!(
            check_active(&conn, fenced),
            Err(CoreError::BadTransactionState {
                state: TransactionState::Rollback,
                ..
            })
        ));
        assert_eq!(fence(&conn, committed).unwrap(), Some(TransactionState::Commit));
        assert_eq!(fence(&conn, TransactionId::new(3)).unwrap(), None);
    }

    #[test]
    fn stale_lists_idle_rows_in_any_state() {
        let (_dir, conn) = open();
        insert(&conn, TransactionId::new(1)).unwrap();
        insert(&conn, TransactionId::new(2)).unwrap();
        insert(&conn, TransactionId::new(3)).unwrap();
        conn.execute(
            "UPDATE transactions SET state = 'commit', last_request = 0 WHERE transaction_id = 2",
            [],
        )
        .unwrap();
        conn.execute(
            "UPDATE transactions SET last_request = 10 WHERE transaction_id = 1",
            [],
        )
        .unwrap();

        let stale = stale(&conn, Duration::from_secs(1)).unwrap();
        let ids: Vec<_> = stale.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![TransactionId::new(2), TransactionId::new(1)]);
    }

    #[test]
    fn release_clears_locks_and_row() {
        let (_dir, mut conn) = open();
        let id = TransactionId::new(7);
        insert(&conn, id).unwrap();
        conn.execute(
            "INSERT INTO resources (transaction_id, state) VALUES (7, 'active'), (7, 'active'), (NULL, 'active')",
            [],
        )
        .unwrap();
        assert_eq!(owned_resources(&conn, id).unwrap().len(), 2);

        assert_eq!(release(&mut conn, id).unwrap(), 2);
        assert!(get(&conn, id).unwrap().is_none());
        assert!(owned_resources(&conn, id).unwrap().is_empty());
    }
}
