//! Commit and rollback of finished transactions.
//!
//! Everything here is synchronous and runs on the coordinator's blocking
//! pool. Writes go through the worker's read/write connection; the pinned
//! snapshot is only read.

use arkive_core::metadata::{self, ResourceRows};
use arkive_core::transaction::table;
use arkive_core::{
    now_millis, CoreResult, ResourceId, ResourceState, SchemaConfig, Snapshot, TransactionId,
    TransactionState,
};
use arkive_storage::PayloadStore;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::fmt;

/// Appends every statement about the resources owned by `?1` to the
/// history. `UNION` (not `UNION ALL`) keeps exactly one row per distinct
/// statement.
const HISTORY_SQL: &str = "
INSERT INTO metadata_history (date, id, property, type, lang, value)
SELECT ?2, s.id, s.property, s.type, s.lang, s.value FROM (
    SELECT m.id, m.property, m.type, m.lang, m.value
      FROM metadata m JOIN resources r ON r.id = m.id
     WHERE r.transaction_id = ?1
    UNION
    SELECT i.id, ?3, 'ID', '', i.ids
      FROM identifiers i JOIN resources r ON r.id = i.id
     WHERE r.transaction_id = ?1
    UNION
    SELECT l.id, l.property, 'REL', '', CAST(l.target_id AS TEXT)
      FROM relations l JOIN resources r ON r.id = l.id
     WHERE r.transaction_id = ?1
) AS s";

/// Why a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The client requested a commit.
    Commit,
    /// The transaction is rolled back.
    Rollback(RollbackReason),
}

/// Why a transaction is rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackReason {
    /// The client requested it.
    Requested,
    /// The heartbeat is older than the timeout.
    TimedOut,
    /// The transaction row disappeared.
    Vanished,
    /// The id could not be reported to the client.
    Unreported,
    /// The database could not be polled for longer than the timeout.
    Unreachable,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Commit => f.write_str("commit"),
            Outcome::Rollback(RollbackReason::Requested) => f.write_str("rollback"),
            Outcome::Rollback(RollbackReason::TimedOut) => f.write_str("rollback (timed out)"),
            Outcome::Rollback(RollbackReason::Vanished) => f.write_str("rollback (row vanished)"),
            Outcome::Rollback(RollbackReason::Unreported) => {
                f.write_str("rollback (id not delivered)")
            }
            Outcome::Rollback(RollbackReason::Unreachable) => {
                f.write_str("rollback (database unreachable)")
            }
        }
    }
}

/// Per-resource rollback plan read from the snapshot.
#[derive(Debug, Default)]
struct RollbackPlan {
    /// Resources that did not exist before the transaction.
    created: Vec<ResourceId>,
    /// Resources that existed, with everything needed to restore them.
    restored: Vec<Prior>,
}

#[derive(Debug)]
struct Prior {
    id: ResourceId,
    state: ResourceState,
    rows: ResourceRows,
    had_payload: bool,
}

/// Counts reported after a successful reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    /// Resources that were restored or committed.
    pub resources: usize,
    /// Resources that were physically removed.
    pub removed: usize,
    /// History rows written (commit only).
    pub history_rows: usize,
}

/// Applies commits and rollbacks.
#[derive(Debug, Clone)]
pub struct Reconciler {
    payloads: PayloadStore,
    schema: SchemaConfig,
}

impl Reconciler {
    /// Creates a reconciler over the given payload store.
    pub fn new(payloads: PayloadStore, schema: SchemaConfig) -> Self {
        Self { payloads, schema }
    }

    /// Returns the payload store.
    pub fn payloads(&self) -> &PayloadStore {
        &self.payloads
    }

    /// Settles the final outcome and closes the transaction to requests.
    ///
    /// A rollback the coordinator decided on its own (timeout, undelivered
    /// id, unreadable or vanished row) first moves the row from `active` to
    /// `rollback`, so writes arriving during reconciliation are rejected.
    /// A commit the client managed to request before that wins.
    pub fn settle(cur: &Connection, txid: TransactionId, outcome: Outcome) -> Outcome {
        match outcome {
            Outcome::Commit | Outcome::Rollback(RollbackReason::Requested) => outcome,
            Outcome::Rollback(_) => match table::fence(cur, txid) {
                Ok(Some(TransactionState::Commit)) => {
                    tracing::info!(%txid, "commit requested before the rollback took hold");
                    Outcome::Commit
                }
                Ok(_) => outcome,
                Err(e) => {
                    tracing::warn!(%txid, error = %e, "failed to fence transaction");
                    outcome
                }
            },
        }
    }

    /// Settles `outcome`, applies it, closes the snapshot and releases the
    /// transaction.
    ///
    /// A failed commit or rollback is logged and does not stop the
    /// transaction row from being removed and its locks cleared.
    ///
    /// # Errors
    ///
    /// Returns an error only if the final release fails.
    pub fn finish(
        &self,
        cur: &mut Connection,
        snapshot: Snapshot,
        txid: TransactionId,
        outcome: Outcome,
    ) -> CoreResult<usize> {
        let outcome = Self::settle(cur, txid, outcome);
        let applied = match outcome {
            Outcome::Commit => self.commit(cur, txid),
            Outcome::Rollback(_) => self.rollback(cur, snapshot.conn(), txid),
        };
        match applied {
            Ok(summary) => tracing::info!(
                %txid,
                %outcome,
                resources = summary.resources,
                removed = summary.removed,
                history_rows = summary.history_rows,
                "transaction reconciled"
            ),
            Err(e) => tracing::error!(%txid, %outcome, error = %e, "transaction reconciliation failed"),
        }
        if let Err(e) = snapshot.close() {
            tracing::warn!(%txid, error = %e, "failed to close snapshot");
        }
        table::release(cur, txid)
    }

    /// Commits `txid`: writes history, purges deleted resources and drops
    /// the transaction's payload backups.
    ///
    /// # Errors
    ///
    /// Returns an error if the database transaction fails; payload cleanup
    /// errors are logged.
    pub fn commit(&self, cur: &mut Connection, txid: TransactionId) -> CoreResult<Summary> {
        let owned = table::owned_resources(cur, txid)?;
        let tx = cur.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let history_rows =
            tx.execute(HISTORY_SQL, params![txid, now_millis(), self.schema.id_property])?;
        let purged: Vec<ResourceId> = {
            let mut stmt = tx.prepare(
                "DELETE FROM resources WHERE transaction_id = ?1 AND state = 'deleted' RETURNING id",
            )?;
            let rows = stmt.query_map([txid], |row| row.get(0))?;
            let ids = rows.collect::<Result<Vec<ResourceId>, _>>()?;
            ids
        };
        tx.commit()?;

        for id in &owned {
            self.discard(*id, Some(txid));
        }
        for id in &purged {
            self.discard(*id, None);
        }
        Ok(Summary {
            resources: owned.len(),
            removed: purged.len(),
            history_rows,
        })
    }

    /// Rolls `txid` back to the state visible in `snapshot`.
    ///
    /// Resources created by the transaction are deleted along with their
    /// payloads. Pre-existing resources get their state, rows and payload
    /// back.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the plan or the database transaction
    /// fails. Payload backups are restored even then.
    pub fn rollback(
        &self,
        cur: &mut Connection,
        snapshot: &Connection,
        txid: TransactionId,
    ) -> CoreResult<Summary> {
        let owned = table::owned_resources(cur, txid)?;
        let plan = match self.plan(snapshot, &owned) {
            Ok(plan) => plan,
            Err(e) => {
                self.restore_backups(&owned, txid);
                return Err(e);
            }
        };

        let applied = Self::apply_rows(cur, &plan);
        for prior in &plan.restored {
            if prior.had_payload {
                if let Err(e) = self.payloads.restore(prior.id.as_u64(), txid.as_u64()) {
                    tracing::error!(resource_id = %prior.id, %txid, error = %e, "payload restore failed");
                }
            } else if applied.is_ok() {
                // Nothing to go back to: any file here was written by the
                // transaction, backups included.
                self.discard(prior.id, None);
                self.discard(prior.id, Some(txid));
            }
        }
        applied?;

        for id in &plan.created {
            self.discard(*id, None);
            self.discard(*id, Some(txid));
        }
        Ok(Summary {
            resources: plan.restored.len(),
            removed: plan.created.len(),
            history_rows: 0,
        })
    }

    /// Releases a transaction nobody supervises any more.
    ///
    /// Without a snapshot only the payload backups can be put back; rows
    /// keep whatever the transaction wrote.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cleanup fails.
    pub fn release_orphan(&self, cur: &mut Connection, txid: TransactionId) -> CoreResult<usize> {
        if let Err(e) = table::fence(cur, txid) {
            tracing::warn!(%txid, error = %e, "failed to fence orphaned transaction");
        }
        let owned = table::owned_resources(cur, txid)?;
        self.restore_backups(&owned, txid);
        let released = table::release(cur, txid)?;
        tracing::warn!(
            %txid,
            released,
            "released orphaned transaction; metadata changes could not be reverted"
        );
        Ok(released)
    }

    fn plan(&self, snapshot: &Connection, owned: &[ResourceId]) -> CoreResult<RollbackPlan> {
        let mut plan = RollbackPlan::default();
        for &id in owned {
            let state: Option<ResourceState> = snapshot
                .query_row("SELECT state FROM resources WHERE id = ?1", [id], |row| {
                    row.get(0)
                })
                .optional()?;
            match state {
                None => plan.created.push(id),
                Some(state) => {
                    let rows = ResourceRows::load(snapshot, id)?;
                    let had_payload = rows.value_of(&self.schema.hash_property).is_some();
                    plan.restored.push(Prior {
                        id,
                        state,
                        rows,
                        had_payload,
                    });
                }
            }
        }
        Ok(plan)
    }

    fn apply_rows(cur: &mut Connection, plan: &RollbackPlan) -> CoreResult<()> {
        let tx = cur.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for id in &plan.created {
            tx.execute("DELETE FROM resources WHERE id = ?1", [id])?;
        }
        for prior in &plan.restored {
            metadata::delete_all(&tx, prior.id)?;
            tx.execute(
                "UPDATE resources SET state = ?2 WHERE id = ?1",
                params![prior.id, prior.state],
            )?;
        }
        for prior in &plan.restored {
            prior.rows.insert(&tx)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn restore_backups(&self, owned: &[ResourceId], txid: TransactionId) {
        for id in owned {
            match self.payloads.restore(id.as_u64(), txid.as_u64()) {
                Ok(true) => tracing::debug!(resource_id = %id, %txid, "payload restored"),
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(resource_id = %id, %txid, error = %e, "payload restore failed")
                }
            }
        }
    }

    fn discard(&self, id: ResourceId, txid: Option<TransactionId>) {
        if let Err(e) = self.payloads.delete(id.as_u64(), txid.map(TransactionId::as_u64)) {
            tracing::warn!(resource_id = %id, error = %e, "payload cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arkive_core::{db, CoreError, Triple};
    use arkive_testkit::{TestRepo, TITLE, XSD_STRING};

    fn reconciler(repo: &TestRepo) -> Reconciler {
        Reconciler::new(repo.payloads().clone(), repo.config.schema.clone())
    }

    #[test]
    fn rollback_restores_modified_resource() {
        let repo = TestRepo::new();
        let id = repo.seed("before", b"old bytes");
        let snapshot = Snapshot::pin(&repo.config.database).unwrap();
        let txid = repo.begin_unsupervised();

        repo.replace_metadata(id, txid, &[Triple::new(TITLE, XSD_STRING, "after")])
            .unwrap();
        repo.upload_payload(id, txid, &b"new bytes"[..]).unwrap();
        assert_eq!(repo.title(id).as_deref(), Some("after"));

        let mut cur = db::open(&repo.config.database).unwrap();
        let summary = reconciler(&repo)
            .rollback(&mut cur, snapshot.conn(), txid)
            .unwrap();
        assert_eq!(summary.resources, 1);

        assert_eq!(repo.title(id).as_deref(), Some("before"));
        assert_eq!(repo.payload(id).unwrap(), b"old bytes");
        assert!(!repo.has_backup(id, txid));
    }

    #[test]
    fn rollback_removes_payload_written_to_payloadless_resource() {
        let repo = TestRepo::new();
        let id = repo.seed_with(|store, txid| store.create(txid).unwrap());
        let snapshot = Snapshot::pin(&repo.config.database).unwrap();
        let txid = repo.begin_unsupervised();

        repo.upload_payload(id, txid, &b"first"[..]).unwrap();
        repo.upload_payload(id, txid, &b"second"[..]).unwrap();

        let mut cur = db::open(&repo.config.database).unwrap();
        reconciler(&repo)
            .rollback(&mut cur, snapshot.conn(), txid)
            .unwrap();
        assert!(repo.payload(id).is_none());
        assert!(!repo.has_backup(id, txid));
    }

    #[test]
    fn commit_purges_deleted_resources() {
        let repo = TestRepo::new();
        let id = repo.seed("doomed", b"bytes");
        let txid = repo.begin_unsupervised();
        repo.delete(id, txid).unwrap();
        repo.delete_tombstone(id, txid).unwrap();

        let mut cur = db::open(&repo.config.database).unwrap();
        let summary = reconciler(&repo).commit(&mut cur, txid).unwrap();
        assert_eq!(summary.removed, 1);
        assert_eq!(repo.state(id).unwrap(), None);
        assert!(!repo.has_backup(id, txid));
        assert!(repo.payload(id).is_none());
    }

    #[test]
    fn orphan_release_restores_backups_and_locks() {
        let repo = TestRepo::new();
        let id = repo.seed("kept", b"original");
        let txid = repo.begin_unsupervised();
        repo.upload_payload(id, txid, &b"changed"[..]).unwrap();

        let mut cur = db::open(&repo.config.database).unwrap();
        let released = reconciler(&repo).release_orphan(&mut cur, txid).unwrap();
        assert_eq!(released, 1);
        assert_eq!(repo.payload(id).unwrap(), b"original");
        assert_eq!(repo.owner(id).unwrap(), None);
        assert_eq!(repo.transaction_count(), 0);
    }

    #[test]
    fn orphan_release_drops_payload_of_payloadless_resource() {
        let repo = TestRepo::new();
        let id = repo.seed("empty", b"");
        let txid = repo.begin_unsupervised();
        repo.upload_payload(id, txid, &b"first"[..]).unwrap();
        repo.upload_payload(id, txid, &b"second"[..]).unwrap();

        let mut cur = db::open(&repo.config.database).unwrap();
        reconciler(&repo).release_orphan(&mut cur, txid).unwrap();
        assert!(repo.payload(id).is_none());
        assert!(!repo.has_backup(id, txid));
        assert_eq!(repo.owner(id).unwrap(), None);
    }

    #[test]
    fn orphan_release_after_upload_and_delete_keeps_original() {
        let repo = TestRepo::new();
        let id = repo.seed("kept", b"original");
        let txid = repo.begin_unsupervised();
        repo.upload_payload(id, txid, &b"changed"[..]).unwrap();
        repo.delete(id, txid).unwrap();

        let mut cur = db::open(&repo.config.database).unwrap();
        reconciler(&repo).release_orphan(&mut cur, txid).unwrap();
        assert_eq!(repo.payload(id).unwrap(), b"original");
        assert!(!repo.has_backup(id, txid));
    }

    #[test]
    fn timed_out_transaction_rejects_late_writes() {
        let repo = TestRepo::new();
        let id = repo.seed("before", b"old bytes");
        let snapshot = Snapshot::pin(&repo.config.database).unwrap();
        let txid = repo.begin_unsupervised();
        let created = repo.create(txid).unwrap();
        repo.upload_payload(id, txid, &b"new bytes"[..]).unwrap();

        let mut cur = db::open(&repo.config.database).unwrap();
        let timed_out = Outcome::Rollback(RollbackReason::TimedOut);
        assert_eq!(Reconciler::settle(&cur, txid, timed_out), timed_out);

        assert!(matches!(
            repo.create(txid),
            Err(CoreError::BadTransactionState { .. })
        ));
        assert!(matches!(
            repo.upload_payload(id, txid, &b"late"[..]),
            Err(CoreError::BadTransactionState { .. })
        ));
        assert!(matches!(
            repo.acquire(created, txid),
            Err(CoreError::BadTransactionState { .. })
        ));

        reconciler(&repo)
            .finish(&mut cur, snapshot, txid, timed_out)
            .unwrap();
        assert_eq!(repo.state(created).unwrap(), None);
        assert_eq!(repo.payload(id).unwrap(), b"old bytes");
        assert_eq!(repo.title(id).as_deref(), Some("before"));
        assert!(!repo.has_backup(id, txid));
        assert!(matches!(
            repo.create(txid),
            Err(CoreError::UnknownTransaction { .. })
        ));
    }

    #[test]
    fn commit_request_wins_over_timeout() {
        let repo = TestRepo::new();
        let txid = repo.begin_unsupervised();
        table::request(repo.conn(), txid, TransactionState::Commit).unwrap();

        let settled = Reconciler::settle(
            repo.conn(),
            txid,
            Outcome::Rollback(RollbackReason::TimedOut),
        );
        assert_eq!(settled, Outcome::Commit);
        let vanished = Outcome::Rollback(RollbackReason::Vanished);
        assert_eq!(
            Reconciler::settle(repo.conn(), TransactionId::new(1), vanished),
            vanished
        );
    }

    #[test]
    fn outcome_display() {
        assert_eq!(Outcome::Commit.to_string(), "commit");
        assert_eq!(
            Outcome::Rollback(RollbackReason::TimedOut).to_string(),
            "rollback (timed out)"
        );
    }
}
