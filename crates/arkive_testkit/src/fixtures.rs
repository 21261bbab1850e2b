//! Test fixtures and repository helpers.
//!
//! Provides a throwaway repository (SQLite database plus payload tree in a
//! temporary directory) and helpers for common test scenarios.

use arkive_core::transaction::table;
use arkive_core::{
    Endpoint, RepoConfig, ResourceId, ResourceStore, TransactionConfig, TransactionId, Triple,
};
use std::path::Path;
use tempfile::TempDir;

/// Title predicate used by [`TestRepo::seed`].
pub const TITLE: &str = "http://purl.org/dc/terms/title";

/// Datatype used for plain string literals in tests.
pub const XSD_STRING: &str = "http://www.w3.org/2001/XMLSchema#string";

/// Transaction timing suitable for tests: quick polls, a short heartbeat
/// timeout and a fast sweeper.
pub fn fast_transactions() -> TransactionConfig {
    TransactionConfig {
        timeout_ms: 1_500,
        poll_interval_ms: 20,
        max_poll_backoff_ms: 200,
        sweep_interval_ms: 100,
        registration_timeout_ms: 2_000,
    }
}

/// A test repository with automatic cleanup.
pub struct TestRepo {
    /// The repository configuration (everything below the temp dir).
    pub config: RepoConfig,
    /// A resource store on its own connection.
    pub store: ResourceStore,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: TempDir,
}

impl TestRepo {
    /// Creates a repository whose coordinator listens on an ephemeral TCP port.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = RepoConfig::rooted_at(temp_dir.path())
            .with_transactions(fast_transactions())
            .with_listen(Endpoint::Tcp("127.0.0.1:0".to_string()));
        let store = ResourceStore::open(&config).expect("Failed to open resource store");

        Self {
            config,
            store,
            _temp_dir: temp_dir,
        }
    }

    /// Creates a repository whose coordinator listens on a Unix socket.
    pub fn unix() -> Self {
        let mut repo = Self::new();
        repo.config.coordinator.listen = Endpoint::Unix(repo.path().join("coordinator.sock"));
        repo
    }

    /// Returns the repository root.
    pub fn path(&self) -> &Path {
        self._temp_dir.path()
    }

    /// Opens another resource store on a fresh connection.
    pub fn open_store(&self) -> ResourceStore {
        ResourceStore::open(&self.config).expect("Failed to open resource store")
    }

    /// Registers a transaction directly in the table, bypassing the
    /// coordinator. Nothing will ever reconcile it.
    pub fn begin_unsupervised(&self) -> TransactionId {
        table::register(self.store.conn())
            .expect("Failed to register transaction")
            .id
    }

    /// Creates a resource with a title and payload and leaves it committed
    /// and unowned.
    pub fn seed(&self, title: &str, payload: &[u8]) -> ResourceId {
        self.seed_with(|store, txid| {
            let id = store.create(txid).expect("Failed to create resource");
            store
                .replace_metadata(id, txid, &[Triple::new(TITLE, XSD_STRING, title)])
                .expect("Failed to write metadata");
            store
                .upload_payload(id, txid, payload)
                .expect("Failed to upload payload");
            id
        })
    }

    /// Runs `f` inside an unsupervised transaction, then drops its payload
    /// backups and releases it as if it had committed.
    pub fn seed_with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&ResourceStore, TransactionId) -> R,
    {
        let txid = self.begin_unsupervised();
        let result = f(&self.store, txid);
        let owned =
            table::owned_resources(self.store.conn(), txid).expect("Failed to list resources");
        for id in owned {
            self.store
                .payloads()
                .delete(id.as_u64(), Some(txid.as_u64()))
                .expect("Failed to drop backup");
        }
        let mut conn = arkive_core::db::open(&self.config.database)
            .expect("Failed to open database");
        table::release(&mut conn, txid).expect("Failed to release transaction");
        result
    }

    /// Reads the live payload of `id`, if any.
    pub fn payload(&self, id: ResourceId) -> Option<Vec<u8>> {
        let path = self.store.payloads().path(id.as_u64());
        std::fs::read(path).ok()
    }

    /// Returns whether a backup of `id` suffixed with `txid` exists.
    pub fn has_backup(&self, id: ResourceId, txid: TransactionId) -> bool {
        self.store.payloads().has_backup(id.as_u64(), txid.as_u64())
    }

    /// Returns the title of `id`, reading the raw table.
    pub fn title(&self, id: ResourceId) -> Option<String> {
        arkive_core::ResourceRows::load(self.store.conn(), id)
            .expect("Failed to load rows")
            .value_of(TITLE)
            .map(str::to_string)
    }

    /// Returns the history rows of `id` as (property, type, lang, value).
    pub fn history(&self, id: ResourceId) -> Vec<(String, String, String, String)> {
        let mut stmt = self
            .store
            .conn()
            .prepare(
                "SELECT property, type, lang, value FROM metadata_history
                 WHERE id = ?1 ORDER BY property, value",
            )
            .expect("Failed to prepare history query");
        let rows = stmt
            .query_map([id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .expect("Failed to query history");
        rows.collect::<Result<Vec<_>, rusqlite::Error>>()
            .expect("Failed to read history")
    }

    /// Returns the number of rows in the `transactions` table.
    pub fn transaction_count(&self) -> usize {
        table::list(self.store.conn())
            .expect("Failed to list transactions")
            .len()
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestRepo {
    type Target = ResourceStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Runs a test with a temporary repository.
///
/// # Example
///
/// ```rust,ignore
/// use arkive_testkit::with_temp_repo;
///
/// #[test]
/// fn my_test() {
///     with_temp_repo(|repo| {
///         let id = repo.seed("A", b"bytes");
///         assert_eq!(repo.payload(id).unwrap(), b"bytes");
///     });
/// }
/// ```
pub fn with_temp_repo<F, R>(f: F) -> R
where
    F: FnOnce(&TestRepo) -> R,
{
    let repo = TestRepo::new();
    f(&repo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arkive_core::ResourceState;

    #[test]
    fn seed_leaves_unowned_resource() {
        with_temp_repo(|repo| {
            let id = repo.seed("A", b"bytes");
            assert_eq!(repo.owner(id).unwrap(), None);
            assert_eq!(repo.state(id).unwrap(), Some(ResourceState::Active));
            assert_eq!(repo.payload(id).unwrap(), b"bytes");
            assert_eq!(repo.title(id).as_deref(), Some("A"));
            assert_eq!(repo.transaction_count(), 0);
        });
    }

    #[test]
    fn unix_repo_listens_below_root() {
        let repo = TestRepo::unix();
        match &repo.config.coordinator.listen {
            Endpoint::Unix(path) => assert!(path.starts_with(repo.path())),
            Endpoint::Tcp(_) => panic!("expected a unix endpoint"),
        }
    }
}
