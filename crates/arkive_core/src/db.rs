//! Database connections and schema.
//!
//! The repository state lives in one SQLite database in WAL mode:
//!
//! ```text
//! transactions      (transaction_id, started, last_request, state)
//! resources         (id, transaction_id, state)
//! identifiers       (ids, id)
//! relations         (mid, id, target_id, property)
//! metadata          (mid, id, property, type, lang, value)
//! metadata_history  (midh, date, id, property, type, lang, value)
//! ```
//!
//! WAL mode lets a [`Snapshot`] keep reading the database as it was when
//! the snapshot was pinned while other connections keep writing.

use crate::config::DatabaseConfig;
use crate::error::CoreResult;
use rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS transactions (
    transaction_id INTEGER PRIMARY KEY,
    started        INTEGER NOT NULL,
    last_request   INTEGER NOT NULL,
    state          TEXT NOT NULL DEFAULT 'active'
                   CHECK (state IN ('active', 'commit', 'rollback'))
);

CREATE TABLE IF NOT EXISTS resources (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    transaction_id INTEGER REFERENCES transactions (transaction_id) ON DELETE SET NULL,
    state          TEXT NOT NULL DEFAULT 'active'
                   CHECK (state IN ('active', 'tombstone', 'deleted'))
);
CREATE INDEX IF NOT EXISTS resources_transaction_id ON resources (transaction_id);

CREATE TABLE IF NOT EXISTS identifiers (
    ids TEXT PRIMARY KEY,
    id  INTEGER NOT NULL REFERENCES resources (id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS identifiers_id ON identifiers (id);

CREATE TABLE IF NOT EXISTS relations (
    mid       INTEGER PRIMARY KEY AUTOINCREMENT,
    id        INTEGER NOT NULL REFERENCES resources (id) ON DELETE CASCADE,
    target_id INTEGER NOT NULL REFERENCES resources (id) ON DELETE CASCADE,
    property  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS relations_id ON relations (id);
CREATE INDEX IF NOT EXISTS relations_target_id ON relations (target_id);

CREATE TABLE IF NOT EXISTS metadata (
    mid      INTEGER PRIMARY KEY AUTOINCREMENT,
    id       INTEGER NOT NULL REFERENCES resources (id) ON DELETE CASCADE,
    property TEXT NOT NULL,
    type     TEXT NOT NULL,
    lang     TEXT NOT NULL DEFAULT '',
    value    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS metadata_id ON metadata (id);

CREATE TABLE IF NOT EXISTS metadata_history (
    midh     INTEGER PRIMARY KEY AUTOINCREMENT,
    date     INTEGER NOT NULL,
    id       INTEGER NOT NULL,
    property TEXT NOT NULL,
    type     TEXT NOT NULL,
    lang     TEXT NOT NULL,
    value    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS metadata_history_id ON metadata_history (id);
";

/// Opens a read/write connection, creating the schema if needed.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or migrated.
pub fn open(config: &DatabaseConfig) -> CoreResult<Connection> {
    if let Some(parent) = config.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(arkive_storage::StorageError::from)?;
        }
    }
    let conn = Connection::open(&config.path)?;
    configure(&conn, config)?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

fn configure(conn: &Connection, config: &DatabaseConfig) -> CoreResult<()> {
    conn.busy_timeout(config.busy_timeout())?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        tracing::warn!(%mode, "database does not support WAL journaling");
    }
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

/// A read-only view of the database pinned at the moment it was opened.
///
/// The snapshot runs a deferred read transaction and issues a read right
/// away so SQLite fixes the WAL position. Every later query sees the
/// database exactly as it was at that point, which is the serializable,
/// read-only, deferrable view rollback restores from.
pub struct Snapshot {
    conn: Connection,
    open: bool,
}

impl Snapshot {
    /// Opens a new connection and pins its snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the read transaction fails.
    pub fn pin(config: &DatabaseConfig) -> CoreResult<Self> {
        let conn = Connection::open(&config.path)?;
        conn.busy_timeout(config.busy_timeout())?;
        conn.pragma_update(None, "query_only", "ON")?;
        conn.execute_batch("BEGIN DEFERRED")?;
        conn.query_row("SELECT count(*) FROM transactions", [], |row| {
            row.get::<_, i64>(0)
        })?;
        Ok(Self { conn, open: true })
    }

    /// Returns the pinned connection for reading.
    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Ends the read transaction, releasing the pinned snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails.
    pub fn close(mut self) -> CoreResult<()> {
        self.open = false;
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %e, "failed to release database snapshot");
            }
        }
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot").field("open", &self.open).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_schema() {
        let dir = tempdir().unwrap();
        let config = DatabaseConfig::new(dir.path().join("nested").join("db.sqlite"));
        let conn = open(&config).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('transactions', 'resources', 'identifiers',
                              'relations', 'metadata', 'metadata_history')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 6);

        // Reopening is idempotent.
        drop(conn);
        open(&config).unwrap();
    }

    #[test]
    fn snapshot_ignores_later_writes() {
        let dir = tempdir().unwrap();
        let config = DatabaseConfig::new(dir.path().join("db.sqlite"));
        let conn = open(&config).unwrap();
        conn.execute("INSERT INTO resources (state) VALUES ('active')", [])
            .unwrap();

        let snapshot = Snapshot::pin(&config).unwrap();
        conn.execute("INSERT INTO resources (state) VALUES ('active')", [])
            .unwrap();
        conn.execute("UPDATE resources SET state = 'tombstone' WHERE id = 1", [])
            .unwrap();

        let (count, state): (i64, String) = snapshot
            .conn()
            .query_row(
                "SELECT count(*), (SELECT state FROM resources WHERE id = 1) FROM resources",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(state, "active");

        snapshot.close().unwrap();
    }

    #[test]
    fn snapshot_is_read_only() {
        let dir = tempdir().unwrap();
        let config = DatabaseConfig::new(dir.path().join("db.sqlite"));
        let _conn = open(&config).unwrap();

        let snapshot = Snapshot::pin(&config).unwrap();
        let result = snapshot
            .conn()
            .execute("INSERT INTO resources (state) VALUES ('active')", []);
        assert!(result.is_err());
    }
}
