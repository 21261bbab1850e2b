//! Client side of the coordinator: registration and transaction control.

use crate::error::{CoordinatorError, CoordinatorResult};
use arkive_core::transaction::table;
use arkive_core::{
    db, Endpoint, RepoConfig, TransactionConfig, TransactionId, TransactionRecord,
    TransactionState,
};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;

/// Upper bound on a registration reply; a decimal `i64` plus newline fits
/// many times over.
const MAX_REPLY: u64 = 64;

/// Registers a new transaction with the coordinator at `endpoint`.
///
/// Connects, reads one newline-terminated decimal id and returns it.
///
/// # Errors
///
/// - `Connection` if the socket cannot be connected
/// - `RegistrationTimeout` if no complete line arrives within `timeout`
/// - `InvalidResponse` if the line is not a valid id
pub async fn register_transaction(
    endpoint: &Endpoint,
    timeout: Duration,
) -> CoordinatorResult<TransactionId> {
    let reply = match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr.as_str())
                .await
                .map_err(|e| CoordinatorError::connection(endpoint, e))?;
            tokio::time::timeout(timeout, read_reply(stream)).await
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path)
                .await
                .map_err(|e| CoordinatorError::connection(endpoint, e))?;
            tokio::time::timeout(timeout, read_reply(stream)).await
        }
        #[cfg(not(unix))]
        Endpoint::Unix(_) => {
            return Err(CoordinatorError::connection(
                endpoint,
                std::io::Error::from(std::io::ErrorKind::Unsupported),
            ))
        }
    };
    let line = reply.map_err(|_| CoordinatorError::RegistrationTimeout {
        endpoint: endpoint.clone(),
        timeout,
    })??;
    parse_reply(&line)
}

async fn read_reply<S: AsyncRead + Unpin>(stream: S) -> CoordinatorResult<String> {
    use tokio::io::AsyncReadExt;

    let mut reader = BufReader::new(stream.take(MAX_REPLY));
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    Ok(line)
}

fn parse_reply(line: &str) -> CoordinatorResult<TransactionId> {
    if !line.ends_with('\n') {
        return Err(CoordinatorError::invalid_response(if line.is_empty() {
            "connection closed before a transaction id was sent".to_string()
        } else {
            format!("unterminated reply {line:?}")
        }));
    }
    let raw = line.trim_end_matches(['\r', '\n']);
    let id: u64 = raw
        .parse()
        .map_err(|_| CoordinatorError::invalid_response(format!("not a transaction id: {raw:?}")))?;
    if id == 0 || id > TransactionId::MAX {
        return Err(CoordinatorError::invalid_response(format!(
            "transaction id out of range: {id}"
        )));
    }
    Ok(TransactionId::new(id))
}

/// Handle used by request handlers to drive transactions.
///
/// Registration goes through the coordinator socket; heartbeats and
/// completion requests are plain updates of the `transactions` row, which
/// the coordinator picks up on its next poll.
pub struct TransactionClient {
    endpoint: Endpoint,
    registration_timeout: Duration,
    timing: TransactionConfig,
    conn: Mutex<Connection>,
}

impl TransactionClient {
    /// Opens a client with its own database connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(config: &RepoConfig) -> CoordinatorResult<Self> {
        let conn = db::open(&config.database)?;
        Ok(Self::new(conn, config.coordinator.listen.clone(), config.transactions.clone()))
    }

    /// Creates a client from an open connection.
    pub fn new(conn: Connection, endpoint: Endpoint, timing: TransactionConfig) -> Self {
        Self {
            endpoint,
            registration_timeout: timing.registration_timeout(),
            timing,
            conn: Mutex::new(conn),
        }
    }

    /// Points the client at another coordinator endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Returns the coordinator endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Registers a new transaction.
    ///
    /// # Errors
    ///
    /// See [`register_transaction`].
    pub async fn begin(&self) -> CoordinatorResult<TransactionId> {
        let txid = register_transaction(&self.endpoint, self.registration_timeout).await?;
        tracing::debug!(%txid, "transaction started");
        Ok(txid)
    }

    /// Refreshes the heartbeat of `txid`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTransaction`/`BadTransactionState` if `txid` no
    /// longer accepts work.
    pub fn prolong(&self, txid: TransactionId) -> CoordinatorResult<TransactionRecord> {
        Ok(table::check_active(&self.conn.lock(), txid)?)
    }

    /// Asks the coordinator to commit `txid`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTransaction`/`BadTransactionState` if `txid` is not
    /// active.
    pub fn commit(&self, txid: TransactionId) -> CoordinatorResult<()> {
        Ok(table::request(&self.conn.lock(), txid, TransactionState::Commit)?)
    }

    /// Asks the coordinator to roll `txid` back.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTransaction`/`BadTransactionState` if `txid` is not
    /// active.
    pub fn rollback(&self, txid: TransactionId) -> CoordinatorResult<()> {
        Ok(table::request(&self.conn.lock(), txid, TransactionState::Rollback)?)
    }

    /// Returns the row of `txid`, `None` once the coordinator has finished it.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn status(&self, txid: TransactionId) -> CoordinatorResult<Option<TransactionRecord>> {
        Ok(table::get(&self.conn.lock(), txid)?)
    }

    /// Waits until the coordinator has finished `txid`.
    ///
    /// Polls with exponential backoff starting at the configured poll
    /// interval and capped at the maximum backoff.
    ///
    /// # Errors
    ///
    /// Returns `WaitTimeout` if the row is still present after `deadline`.
    pub async fn wait(&self, txid: TransactionId, deadline: Duration) -> CoordinatorResult<()> {
        let started = Instant::now();
        let mut delay = self.timing.poll_interval();
        loop {
            if self.status(txid)?.is_none() {
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= deadline {
                return Err(CoordinatorError::WaitTimeout { txid, waited });
            }
            tokio::time::sleep(delay.min(deadline - waited)).await;
            delay = (delay * 2).min(self.timing.max_poll_backoff());
        }
    }

    /// Requests a commit and waits for the coordinator to apply it.
    ///
    /// # Errors
    ///
    /// See [`commit`](Self::commit) and [`wait`](Self::wait).
    pub async fn commit_and_wait(
        &self,
        txid: TransactionId,
        deadline: Duration,
    ) -> CoordinatorResult<()> {
        self.commit(txid)?;
        self.wait(txid, deadline).await
    }

    /// Requests a rollback and waits for the coordinator to apply it.
    ///
    /// # Errors
    ///
    /// See [`rollback`](Self::rollback) and [`wait`](Self::wait).
    pub async fn rollback_and_wait(
        &self,
        txid: TransactionId,
        deadline: Duration,
    ) -> CoordinatorResult<()> {
        self.rollback(txid)?;
        self.wait(txid, deadline).await
    }
}

impl std::fmt::Debug for TransactionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionClient")
            .field("endpoint", &self.endpoint)
            .field("registration_timeout", &self.registration_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn parse_reply_accepts_decimal_line() {
        assert_eq!(parse_reply("42\n").unwrap(), TransactionId::new(42));
        assert_eq!(parse_reply("42\r\n").unwrap(), TransactionId::new(42));
    }

    #[test]
    fn parse_reply_rejects_garbage() {
        assert!(parse_reply("").is_err());
        assert!(parse_reply("42").is_err());
        assert!(parse_reply("abc\n").is_err());
        assert!(parse_reply("0\n").is_err());
        assert!(parse_reply("-5\n").is_err());
        assert!(parse_reply(&format!("{}\n", u64::MAX)).is_err());
    }

    #[tokio::test]
    async fn refused_connection_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = register_transaction(&Endpoint::Tcp(addr), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Connection { .. }));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(stream);
        });

        let err = register_transaction(&Endpoint::Tcp(addr), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::RegistrationTimeout { .. }));
        server.abort();
    }

    #[tokio::test]
    async fn reads_id_from_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"987654321\n").await.unwrap();
        });

        let txid = register_transaction(&Endpoint::Tcp(addr), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(txid, TransactionId::new(987_654_321));
    }
}
