//! Coordinator server: accept loop, supervisor and sweeper.

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::listener::Listener;
use crate::reconciler::Reconciler;
use crate::registry::Registry;
use crate::worker::{self, WorkerContext};
use arkive_core::transaction::table;
use arkive_core::{db, CoreError, Endpoint, RepoConfig, TransactionId};
use arkive_storage::PayloadStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Interval, MissedTickBehavior};

/// Pause after a failed accept so a persistent error (e.g. out of file
/// descriptors) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

enum Control {
    Reload(Box<RepoConfig>, oneshot::Sender<CoordinatorResult<()>>),
    Stop,
}

/// The transaction coordinator.
///
/// Every connection accepted on the configured socket registers one
/// transaction. A worker task reports the id, supervises the transaction
/// and finally commits or rolls it back. Next to the workers the server
/// runs:
///
/// - a supervisor, which releases the transaction of any worker that ended
///   without finishing it (error or panic)
/// - a sweeper, which periodically releases stale transactions that have
///   no live worker, e.g. left over from a crashed coordinator
///
/// # Example
///
/// ```rust,ignore
/// use arkive_coordinator::Coordinator;
///
/// let handle = Coordinator::bind(config).await?;
/// println!("listening on {}", handle.local_endpoint());
/// // ...
/// handle.stop().await?;
/// ```
pub struct Coordinator {
    config: Arc<RepoConfig>,
    listener: Listener,
    local: Endpoint,
    reconciler: Reconciler,
    registry: Arc<Registry>,
    orphans_tx: mpsc::UnboundedSender<TransactionId>,
    orphans_rx: mpsc::UnboundedReceiver<TransactionId>,
    workers: JoinSet<CoordinatorResult<TransactionId>>,
    housekeeping: JoinSet<()>,
    control: mpsc::Receiver<Control>,
}

impl Coordinator {
    /// Prepares the database, binds the socket and starts serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the database or payload store cannot be set up
    /// or the socket cannot be bound.
    pub async fn bind(config: RepoConfig) -> CoordinatorResult<CoordinatorHandle> {
        let payloads = PayloadStore::new(config.storage.clone()).map_err(CoreError::from)?;
        let database = config.database.clone();
        tokio::task::spawn_blocking(move || db::open(&database).map(drop)).await??;

        let endpoint = config.coordinator.listen.clone();
        let listener = Listener::bind(&endpoint)
            .await
            .map_err(|e| CoordinatorError::connection(&endpoint, e))?;
        let local = listener.local_endpoint()?;
        tracing::info!(endpoint = %local, "coordinator listening");

        let (control_tx, control_rx) = mpsc::channel(8);
        let (orphans_tx, orphans_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Registry::default());
        let server = Self {
            reconciler: Reconciler::new(payloads, config.schema.clone()),
            config: Arc::new(config),
            listener,
            local: local.clone(),
            registry: Arc::clone(&registry),
            orphans_tx,
            orphans_rx,
            workers: JoinSet::new(),
            housekeeping: JoinSet::new(),
            control: control_rx,
        };
        let task = tokio::spawn(server.run());

        Ok(CoordinatorHandle {
            local,
            registry,
            control: control_tx,
            task,
        })
    }

    async fn run(mut self) -> CoordinatorResult<()> {
        let mut sweeper = sweep_timer(&self.config);

        loop {
            tokio::select! {
                control = self.control.recv() => match control {
                    Some(Control::Reload(config, reply)) => {
                        let result = self.reload(*config);
                        sweeper = sweep_timer(&self.config);
                        // The requester may have given up waiting.
                        let _ = reply.send(result);
                    }
                    Some(Control::Stop) | None => break,
                },
                accepted = self.listener.accept() => match accepted {
                    Ok(stream) => {
                        let ctx = self.context();
                        self.workers.spawn(worker::run(ctx, stream));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(txid) = self.orphans_rx.recv() => self.spawn_release(txid),
                Some(joined) = self.workers.join_next() => log_worker(joined),
                Some(joined) = self.housekeeping.join_next() => log_housekeeping(joined),
                _ = sweeper.tick() => self.spawn_sweep(),
            }
        }

        drop(self.listener);
        tracing::info!(
            in_flight = self.workers.len(),
            "coordinator stopping, waiting for in-flight transactions"
        );
        while let Some(joined) = self.workers.join_next().await {
            log_worker(joined);
        }
        while let Ok(txid) = self.orphans_rx.try_recv() {
            let reconciler = self.reconciler.clone();
            let config = Arc::clone(&self.config);
            self.housekeeping
                .spawn_blocking(move || release_orphan(&config, &reconciler, txid));
        }
        while let Some(joined) = self.housekeeping.join_next().await {
            log_housekeeping(joined);
        }
        tracing::info!("coordinator stopped");
        Ok(())
    }

    fn context(&self) -> WorkerContext {
        WorkerContext {
            config: Arc::clone(&self.config),
            reconciler: self.reconciler.clone(),
            registry: Arc::clone(&self.registry),
            orphans: self.orphans_tx.clone(),
        }
    }

    /// Swaps the configuration used for new workers and housekeeping.
    /// Running workers keep theirs and the socket keeps its binding.
    fn reload(&mut self, config: RepoConfig) -> CoordinatorResult<()> {
        let payloads = PayloadStore::new(config.storage.clone()).map_err(CoreError::from)?;
        if config.coordinator.listen != self.config.coordinator.listen {
            tracing::warn!(
                current = %self.local,
                requested = %config.coordinator.listen,
                "listen address changes take effect on restart"
            );
        }
        self.reconciler = Reconciler::new(payloads, config.schema.clone());
        self.config = Arc::new(config);
        tracing::info!("configuration reloaded");
        Ok(())
    }

    fn spawn_release(&mut self, txid: TransactionId) {
        let reconciler = self.reconciler.clone();
        let config = Arc::clone(&self.config);
        self.housekeeping
            .spawn_blocking(move || release_orphan(&config, &reconciler, txid));
    }

    fn spawn_sweep(&mut self) {
        let reconciler = self.reconciler.clone();
        let config = Arc::clone(&self.config);
        let registry = Arc::clone(&self.registry);
        self.housekeeping.spawn_blocking(move || {
            match sweep(&config, &reconciler, |txid| registry.contains(txid)) {
                Ok(released) if !released.is_empty() => {
                    tracing::info!(count = released.len(), "sweeper released stale transactions");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "sweep failed"),
            }
        });
    }
}

/// Handle to a running coordinator.
pub struct CoordinatorHandle {
    local: Endpoint,
    registry: Arc<Registry>,
    control: mpsc::Sender<Control>,
    task: JoinHandle<CoordinatorResult<()>>,
}

impl CoordinatorHandle {
    /// Returns the endpoint clients connect to.
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    /// Returns the number of transactions with a live worker.
    pub fn live_transactions(&self) -> usize {
        self.registry.len()
    }

    /// Returns true until the server has stopped.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Applies a new configuration to transactions registered from now on.
    ///
    /// # Errors
    ///
    /// Returns an error if the new payload settings are invalid (the old
    /// configuration stays in force) or the server has stopped.
    pub async fn reload(&self, config: RepoConfig) -> CoordinatorResult<()> {
        let (reply, done) = oneshot::channel();
        self.control
            .send(Control::Reload(Box::new(config), reply))
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        done.await.map_err(|_| CoordinatorError::Stopped)?
    }

    /// Stops accepting connections and waits for in-flight transactions
    /// to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the server task failed.
    pub async fn stop(self) -> CoordinatorResult<()> {
        // A closed channel means the server already left its loop.
        let _ = self.control.send(Control::Stop).await;
        self.task.await?
    }
}

impl std::fmt::Debug for CoordinatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorHandle")
            .field("local", &self.local)
            .field("live_transactions", &self.live_transactions())
            .finish_non_exhaustive()
    }
}

/// Releases every stale transaction for which `is_live` is false.
///
/// A transaction is stale once its last request is older than the
/// heartbeat timeout. Returns the released ids.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or queried. Failures
/// releasing individual transactions are logged.
pub fn sweep<F>(
    config: &RepoConfig,
    reconciler: &Reconciler,
    is_live: F,
) -> CoordinatorResult<Vec<TransactionId>>
where
    F: Fn(TransactionId) -> bool,
{
    let mut conn = db::open(&config.database)?;
    let stale = table::stale(&conn, config.transactions.timeout())?;
    let mut released = Vec::new();
    for record in stale {
        if is_live(record.id) {
            continue;
        }
        match reconciler.release_orphan(&mut conn, record.id) {
            Ok(_) => released.push(record.id),
            Err(e) => tracing::error!(txid = %record.id, error = %e, "failed to release stale transaction"),
        }
    }
    Ok(released)
}

fn release_orphan(config: &RepoConfig, reconciler: &Reconciler, txid: TransactionId) {
    let result = db::open(&config.database)
        .and_then(|mut conn| reconciler.release_orphan(&mut conn, txid));
    if let Err(e) = result {
        tracing::error!(%txid, error = %e, "failed to release orphaned transaction");
    }
}

fn sweep_timer(config: &RepoConfig) -> Interval {
    let mut timer = tokio::time::interval(config.transactions.sweep_interval());
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

fn log_worker(joined: Result<CoordinatorResult<TransactionId>, JoinError>) {
    match joined {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "transaction worker failed"),
        Err(e) if e.is_panic() => tracing::error!(error = %e, "transaction worker panicked"),
        Err(e) => tracing::warn!(error = %e, "transaction worker cancelled"),
    }
}

fn log_housekeeping(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "housekeeping task failed");
    }
}
