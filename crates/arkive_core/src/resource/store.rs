//! Resource store: ownership, lifecycle transitions and payload writes.

use crate::config::{RepoConfig, SchemaConfig};
use crate::db;
use crate::error::{read_guard, CoreError, CoreResult};
use crate::metadata::{self, IdentifierRow, MetadataRow, RelationRow, Triple};
use crate::resource::state::{AcquireMode, ResourceState};
use crate::transaction::table;
use crate::types::{ResourceId, TransactionId};
use arkive_storage::{PayloadStore, Upload};
use rusqlite::{params, Connection, OptionalExtension};
use std::io::Read;
use std::path::PathBuf;

const SIZE_TYPE: &str = "http://www.w3.org/2001/XMLSchema#long";
const HASH_TYPE: &str = "http://www.w3.org/2001/XMLSchema#string";

/// Entry point for request handlers mutating resources.
///
/// Every write first *acquires* the resource for the presented transaction:
/// the `transaction_id` column is set if it is free or already ours, and the
/// write fails immediately with [`CoreError::Conflict`] if another
/// transaction holds it. Nothing here ever waits for a lock held by another
/// transaction; retrying is the caller's decision.
///
/// # Example
///
/// ```rust,ignore
/// let store = ResourceStore::open(&config)?;
/// let id = store.create(txid)?;
/// store.replace_metadata(id, txid, &[Triple::new("urn:title", "xsd:string", "A")])?;
/// store.upload_payload(id, txid, body)?;
/// ```
pub struct ResourceStore {
    conn: Connection,
    payloads: PayloadStore,
    schema: SchemaConfig,
}

impl ResourceStore {
    /// Opens a store with its own database connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the database or the payload store cannot be set up.
    pub fn open(config: &RepoConfig) -> CoreResult<Self> {
        let conn = db::open(&config.database)?;
        let payloads = PayloadStore::new(config.storage.clone())?;
        Ok(Self::new(conn, payloads, config.schema.clone()))
    }

    /// Creates a store from its parts.
    #[must_use]
    pub fn new(conn: Connection, payloads: PayloadStore, schema: SchemaConfig) -> Self {
        Self {
            conn,
            payloads,
            schema,
        }
    }

    /// Returns the underlying connection.
    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Returns the payload store.
    #[must_use]
    pub fn payloads(&self) -> &PayloadStore {
        &self.payloads
    }

    /// Creates a new active resource owned by `txid`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTransaction`/`BadTransactionState` for an unusable
    /// transaction, or a database error.
    pub fn create(&self, txid: TransactionId) -> CoreResult<ResourceId> {
        table::check_active(&self.conn, txid)?;
        // Re-checked in the statement: the coordinator may fence the
        // transaction between the two.
        let id: ResourceId = self
            .conn
            .query_row(
                "INSERT INTO resources (transaction_id, state)
                 SELECT ?1, 'active' WHERE EXISTS (
                     SELECT 1 FROM transactions WHERE transaction_id = ?1 AND state = 'active')
                 RETURNING id",
                [txid],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| table::rejection(&self.conn, txid))?;
        tracing::debug!(resource_id = %id, %txid, "resource created");
        Ok(id)
    }

    /// Returns the stored state of `id`, `None` if there is no such row.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn state(&self, id: ResourceId) -> CoreResult<Option<ResourceState>> {
        let state = self
            .conn
            .query_row("SELECT state FROM resources WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(state)
    }

    /// Returns the transaction currently owning `id`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no such row.
    pub fn owner(&self, id: ResourceId) -> CoreResult<Option<TransactionId>> {
        self.conn
            .query_row(
                "SELECT transaction_id FROM resources WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| CoreError::not_found(id))
    }

    /// Read guard: succeeds only for active resources.
    ///
    /// # Errors
    ///
    /// Returns `Gone` for tombstones and `NotFound` for anything else.
    pub fn check_readable(&self, id: ResourceId) -> CoreResult<ResourceState> {
        read_guard(id, self.state(id)?)
    }

    /// Acquires `id` for writing under `txid` and returns its state.
    ///
    /// Re-acquiring a resource the transaction already owns succeeds. The
    /// transaction's heartbeat is refreshed as a side effect.
    ///
    /// # Errors
    ///
    /// - `UnknownTransaction`/`BadTransactionState` for an unusable transaction
    /// - `NotFound` if the resource does not exist or is deleted
    /// - `Conflict` if another transaction owns it
    pub fn acquire(&self, id: ResourceId, txid: TransactionId) -> CoreResult<ResourceState> {
        table::check_active(&self.conn, txid)?;
        let acquired: Option<ResourceState> = self
            .conn
            .query_row(
                "UPDATE resources SET transaction_id = ?2
                 WHERE id = ?1 AND state <> 'deleted'
                   AND (transaction_id IS NULL OR transaction_id = ?2)
                   AND EXISTS (SELECT 1 FROM transactions
                               WHERE transaction_id = ?2 AND state = 'active')
                 RETURNING state",
                params![id, txid],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(state) = acquired {
            return Ok(state);
        }
        table::check_active(&self.conn, txid)?;

        let current: Option<ResourceState> = self.state(id)?;
        match current {
            None | Some(ResourceState::Deleted) => Err(CoreError::not_found(id)),
            Some(_) => {
                tracing::debug!(resource_id = %id, %txid, "resource locked by another transaction");
                Err(CoreError::conflict(id))
            }
        }
    }

    /// Acquires `id` and checks that its state matches `mode`.
    ///
    /// # Errors
    ///
    /// Everything [`acquire`](Self::acquire) returns, plus `Gone` when an
    /// ordinary write hits a tombstone and `NotFound` when a tombstone write
    /// hits an active resource.
    pub fn acquire_for(
        &self,
        id: ResourceId,
        txid: TransactionId,
        mode: AcquireMode,
    ) -> CoreResult<ResourceState> {
        let state = self.acquire(id, txid)?;
        match (mode, state) {
            (AcquireMode::Resource, ResourceState::Tombstone) => Err(CoreError::gone(id)),
            (AcquireMode::Tombstone, ResourceState::Active) => Err(CoreError::not_found(id)),
            _ => Ok(state),
        }
    }

    /// Attaches an identifier to `id`.
    ///
    /// # Errors
    ///
    /// Returns `IdentifierTaken` if another resource holds the identifier.
    pub fn add_identifier(
        &self,
        id: ResourceId,
        txid: TransactionId,
        identifier: &str,
    ) -> CoreResult<()> {
        self.acquire_for(id, txid, AcquireMode::Resource)?;
        let owner: Option<ResourceId> = self
            .conn
            .query_row(
                "SELECT id FROM identifiers WHERE ids = ?1",
                [identifier],
                |row| row.get(0),
            )
            .optional()?;
        match owner {
            Some(owner) if owner == id => Ok(()),
            Some(owner) => Err(CoreError::IdentifierTaken {
                identifier: identifier.to_string(),
                owner,
            }),
            None => {
                self.conn.execute(
                    "INSERT INTO identifiers (ids, id) VALUES (?1, ?2)",
                    params![identifier, id],
                )?;
                Ok(())
            }
        }
    }

    /// Adds a relation from `id` to `target`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `target` does not exist or is deleted.
    pub fn add_relation(
        &self,
        id: ResourceId,
        txid: TransactionId,
        property: &str,
        target: ResourceId,
    ) -> CoreResult<()> {
        self.acquire_for(id, txid, AcquireMode::Resource)?;
        match self.state(target)? {
            None | Some(ResourceState::Deleted) => return Err(CoreError::not_found(target)),
            Some(_) => {}
        }
        self.conn.execute(
            "INSERT INTO relations (id, target_id, property) VALUES (?1, ?2, ?3)",
            params![id, target, property],
        )?;
        Ok(())
    }

    /// Replaces the user metadata of `id`.
    ///
    /// Payload triples (hash and size) are managed by
    /// [`upload_payload`](Self::upload_payload) and left untouched.
    ///
    /// # Errors
    ///
    /// Returns the acquire errors or a database error.
    pub fn replace_metadata(
        &self,
        id: ResourceId,
        txid: TransactionId,
        triples: &[Triple],
    ) -> CoreResult<()> {
        self.acquire_for(id, txid, AcquireMode::Resource)?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM metadata WHERE id = ?1 AND property NOT IN (?2, ?3)",
            params![id, self.schema.hash_property, self.schema.size_property],
        )?;
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO metadata (id, property, type, lang, value)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for t in triples {
                if self.is_payload_property(&t.property) {
                    continue;
                }
                insert.execute(params![id, t.property, t.kind, t.lang, t.value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Stores a new payload for `id` and records its hash and size.
    ///
    /// The first write in a transaction preserves the pre-transaction
    /// payload (or its absence) in the backup slot; later uploads simply
    /// overwrite the live file. An empty body removes the payload and its
    /// triples.
    ///
    /// # Errors
    ///
    /// Returns the acquire errors, a storage error or a database error.
    pub fn upload_payload<R: Read>(
        &self,
        id: ResourceId,
        txid: TransactionId,
        body: R,
    ) -> CoreResult<Upload> {
        self.acquire_for(id, txid, AcquireMode::Resource)?;
        self.payloads.preserve(id.as_u64(), txid.as_u64())?;
        let upload = self.payloads.upload(id.as_u64(), body)?;

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM metadata WHERE id = ?1 AND property IN (?2, ?3)",
            params![id, self.schema.hash_property, self.schema.size_property],
        )?;
        if let Some(hash) = &upload.hash {
            tx.execute(
                "INSERT INTO metadata (id, property, type, lang, value) VALUES (?1, ?2, ?3, '', ?4)",
                params![id, self.schema.hash_property, HASH_TYPE, hash],
            )?;
            tx.execute(
                "INSERT INTO metadata (id, property, type, lang, value) VALUES (?1, ?2, ?3, '', ?4)",
                params![id, self.schema.size_property, SIZE_TYPE, upload.size.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(upload)
    }

    /// Turns an active resource into a tombstone.
    ///
    /// The payload is moved to the transaction's backup slot and outgoing
    /// relations are removed; identifiers and metadata stay so that access
    /// rules can still be evaluated against the tombstone.
    ///
    /// # Errors
    ///
    /// Returns the acquire errors (`Gone` if it already is a tombstone).
    pub fn delete(&self, id: ResourceId, txid: TransactionId) -> CoreResult<()> {
        self.acquire_for(id, txid, AcquireMode::Resource)?;
        self.stash_payload(id, txid)?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM relations WHERE id = ?1", [id])?;
        tx.execute(
            "UPDATE resources SET state = 'tombstone' WHERE id = ?1",
            [id],
        )?;
        tx.commit()?;
        tracing::debug!(resource_id = %id, %txid, "resource tombstoned");
        Ok(())
    }

    /// Deletes a tombstone for good.
    ///
    /// # Errors
    ///
    /// Returns the acquire errors (`NotFound` if it is not a tombstone).
    pub fn delete_tombstone(&self, id: ResourceId, txid: TransactionId) -> CoreResult<()> {
        self.acquire_for(id, txid, AcquireMode::Tombstone)?;
        self.stash_payload(id, txid)?;
        let tx = self.conn.unchecked_transaction()?;
        metadata::delete_all(&tx, id)?;
        tx.execute("UPDATE resources SET state = 'deleted' WHERE id = ?1", [id])?;
        tx.commit()?;
        tracing::debug!(resource_id = %id, %txid, "tombstone deleted");
        Ok(())
    }

    /// Returns the metadata of a readable resource.
    ///
    /// # Errors
    ///
    /// Returns the read guard errors.
    pub fn metadata(&self, id: ResourceId) -> CoreResult<Vec<MetadataRow>> {
        self.check_readable(id)?;
        metadata::metadata(&self.conn, id)
    }

    /// Returns the identifiers of a readable resource.
    ///
    /// # Errors
    ///
    /// Returns the read guard errors.
    pub fn identifiers(&self, id: ResourceId) -> CoreResult<Vec<IdentifierRow>> {
        self.check_readable(id)?;
        metadata::identifiers(&self.conn, id)
    }

    /// Returns the outgoing relations of a readable resource.
    ///
    /// # Errors
    ///
    /// Returns the read guard errors.
    pub fn relations(&self, id: ResourceId) -> CoreResult<Vec<RelationRow>> {
        self.check_readable(id)?;
        metadata::relations(&self.conn, id)
    }

    /// Returns the live payload path of a readable resource, if it has one.
    ///
    /// # Errors
    ///
    /// Returns the read guard errors.
    pub fn payload_path(&self, id: ResourceId) -> CoreResult<Option<PathBuf>> {
        self.check_readable(id)?;
        let path = self.payloads.path(id.as_u64());
        Ok(path.is_file().then_some(path))
    }

    /// Moves the live payload out of the way, keeping the pre-transaction
    /// state in the backup slot.
    fn stash_payload(&self, id: ResourceId, txid: TransactionId) -> CoreResult<()> {
        self.payloads.preserve(id.as_u64(), txid.as_u64())?;
        self.payloads.delete(id.as_u64(), None)?;
        Ok(())
    }

    fn is_payload_property(&self, property: &str) -> bool {
        property == self.schema.hash_property || property == self.schema.size_property
    }
}

impl std::fmt::Debug for ResourceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceStore")
            .field("payloads", &self.payloads)
            .finish_non_exhaustive()
    }
}
