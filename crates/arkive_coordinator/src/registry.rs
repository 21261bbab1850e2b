//! Bookkeeping of transactions that currently have a live worker.

use arkive_core::TransactionId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Set of supervised transactions, shared by workers and the sweeper.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    live: Mutex<HashSet<TransactionId>>,
}

impl Registry {
    pub(crate) fn contains(&self, txid: TransactionId) -> bool {
        self.live.lock().contains(&txid)
    }

    pub(crate) fn len(&self) -> usize {
        self.live.lock().len()
    }

    fn insert(&self, txid: TransactionId) {
        self.live.lock().insert(txid);
    }

    fn remove(&self, txid: TransactionId) {
        self.live.lock().remove(&txid);
    }
}

/// Marks a transaction as supervised for as long as it lives.
///
/// Dropping the guard without calling [`WorkerGuard::finished`] (the worker
/// returned early, failed or panicked) hands the transaction to the
/// supervisor as an orphan.
#[derive(Debug)]
pub(crate) struct WorkerGuard {
    txid: TransactionId,
    registry: Arc<Registry>,
    orphans: UnboundedSender<TransactionId>,
    finished: bool,
}

impl WorkerGuard {
    pub(crate) fn new(
        txid: TransactionId,
        registry: Arc<Registry>,
        orphans: UnboundedSender<TransactionId>,
    ) -> Self {
        registry.insert(txid);
        Self {
            txid,
            registry,
            orphans,
            finished: false,
        }
    }

    pub(crate) fn finished(mut self) {
        self.finished = true;
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.registry.remove(self.txid);
        if !self.finished && self.orphans.send(self.txid).is_err() {
            tracing::warn!(txid = %self.txid, "supervisor gone; orphaned transaction left for the sweeper");
        }
    }
}
