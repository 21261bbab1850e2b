//! Error types for the coordinator.

use arkive_core::{CoreError, Endpoint, TransactionId};
use std::time::Duration;
use thiserror::Error;

/// Result type for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Errors that can occur talking to or running the coordinator.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// The coordinator socket could not be connected or bound.
    #[error("cannot connect to coordinator at {endpoint}: {source}")]
    Connection {
        /// The socket address.
        endpoint: Endpoint,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// No transaction id arrived in time.
    #[error("coordinator at {endpoint} sent no transaction id within {timeout:?}")]
    RegistrationTimeout {
        /// The socket address.
        endpoint: Endpoint,
        /// The configured deadline.
        timeout: Duration,
    },

    /// The coordinator answered with something other than an id.
    #[error("invalid coordinator response: {0}")]
    InvalidResponse(String),

    /// The transaction was still open when the caller stopped waiting.
    #[error("transaction {txid} still open after {waited:?}")]
    WaitTimeout {
        /// The awaited transaction.
        txid: TransactionId,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The coordinator has shut down.
    #[error("coordinator is not running")]
    Stopped,

    /// A blocking database task died.
    #[error("background task failed: {0}")]
    Task(String),

    /// Core error (database, resource or transaction table).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoordinatorError {
    /// Creates a connection error.
    pub fn connection(endpoint: &Endpoint, source: std::io::Error) -> Self {
        Self::Connection {
            endpoint: endpoint.clone(),
            source,
        }
    }

    /// Creates an invalid response error.
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse(message.into())
    }

    /// Returns true if the request may succeed when repeated later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoordinatorError::Connection { .. } | CoordinatorError::RegistrationTimeout { .. }
        )
    }
}

impl From<tokio::task::JoinError> for CoordinatorError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

impl From<rusqlite::Error> for CoordinatorError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Core(CoreError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CoordinatorError::RegistrationTimeout {
            endpoint: Endpoint::Tcp("127.0.0.1:1".into()),
            timeout: Duration::from_millis(250),
        };
        let msg = err.to_string();
        assert!(msg.contains("tcp:127.0.0.1:1"));
        assert!(msg.contains("250ms"));
    }

    #[test]
    fn transient_errors() {
        let endpoint = Endpoint::Tcp("127.0.0.1:1".into());
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(CoordinatorError::connection(&endpoint, refused).is_transient());
        assert!(!CoordinatorError::invalid_response("x").is_transient());
        assert!(!CoordinatorError::Stopped.is_transient());
    }
}
