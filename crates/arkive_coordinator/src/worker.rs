//! Per-transaction worker.
//!
//! One worker runs for every accepted connection:
//!
//! 1. open a read/write connection and pin a snapshot
//! 2. insert the transaction row and report its id to the client
//! 3. poll the row until it leaves `active` or its heartbeat expires
//! 4. commit or roll back, then release the row and its locks
//!
//! SQLite calls are short but blocking, so each one runs on the blocking
//! pool; the worker itself only sleeps between polls.

use crate::error::CoordinatorResult;
use crate::listener::ClientStream;
use crate::reconciler::{Outcome, Reconciler, RollbackReason};
use crate::registry::{Registry, WorkerGuard};
use arkive_core::transaction::table;
use arkive_core::{db, RepoConfig, Snapshot, TransactionConfig, TransactionId, TransactionState};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;

/// Everything a worker needs, captured when its connection is accepted.
#[derive(Debug, Clone)]
pub(crate) struct WorkerContext {
    pub(crate) config: Arc<RepoConfig>,
    pub(crate) reconciler: Reconciler,
    pub(crate) registry: Arc<Registry>,
    pub(crate) orphans: UnboundedSender<TransactionId>,
}

/// Registers, supervises and finishes one transaction.
pub(crate) async fn run(
    ctx: WorkerContext,
    mut stream: ClientStream,
) -> CoordinatorResult<TransactionId> {
    let database = ctx.config.database.clone();
    let (cur, snapshot, record) = tokio::task::spawn_blocking(move || -> CoordinatorResult<_> {
        let cur = db::open(&database)?;
        let snapshot = Snapshot::pin(&database)?;
        let record = table::register(&cur)?;
        Ok((cur, snapshot, record))
    })
    .await??;
    let txid = record.id;
    let guard = WorkerGuard::new(txid, Arc::clone(&ctx.registry), ctx.orphans.clone());
    let cur = Arc::new(Mutex::new(cur));

    let outcome = match stream.report(txid).await {
        Ok(()) => {
            drop(stream);
            tracing::info!(%txid, "transaction registered");
            supervise(&cur, txid, &ctx.config.transactions).await
        }
        Err(e) => {
            tracing::warn!(%txid, error = %e, "could not report transaction id to client");
            Outcome::Rollback(RollbackReason::Unreported)
        }
    };

    let reconciler = ctx.reconciler.clone();
    let released = tokio::task::spawn_blocking(move || {
        reconciler.finish(&mut cur.lock(), snapshot, txid, outcome)
    })
    .await??;
    guard.finished();
    tracing::debug!(%txid, released, "transaction closed");
    Ok(txid)
}

/// Polls the transaction row until the transaction has to end.
///
/// Polls run at the configured interval. While the database fails, the
/// interval doubles up to the maximum backoff, and once polls have failed
/// for longer than the heartbeat timeout the transaction is rolled back.
async fn supervise(
    cur: &Arc<Mutex<Connection>>,
    txid: TransactionId,
    timing: &TransactionConfig,
) -> Outcome {
    let interval = timing.poll_interval();
    let timeout = timing.timeout();
    let mut delay = interval;
    let mut last_success = Instant::now();

    loop {
        tokio::time::sleep(delay).await;
        let conn = Arc::clone(cur);
        let polled = tokio::task::spawn_blocking(move || table::get(&conn.lock(), txid)).await;
        let failure = match polled {
            Ok(Ok(Some(record))) => {
                match record.state {
                    TransactionState::Commit => return Outcome::Commit,
                    TransactionState::Rollback => {
                        return Outcome::Rollback(RollbackReason::Requested)
                    }
                    TransactionState::Active if record.is_expired(timeout) => {
                        tracing::info!(%txid, idle = ?record.idle_for(), "transaction timed out");
                        return Outcome::Rollback(RollbackReason::TimedOut);
                    }
                    TransactionState::Active => {}
                }
                last_success = Instant::now();
                delay = interval;
                continue;
            }
            Ok(Ok(None)) => return Outcome::Rollback(RollbackReason::Vanished),
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };

        if last_success.elapsed() >= timeout {
            tracing::error!(%txid, error = %failure, "transaction state unreadable, giving up");
            return Outcome::Rollback(RollbackReason::Unreachable);
        }
        delay = (delay * 2).min(timing.max_poll_backoff());
        tracing::warn!(%txid, error = %failure, retry_in = ?delay, "failed to poll transaction state");
    }
}
