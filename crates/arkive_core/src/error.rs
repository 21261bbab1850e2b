//! Error types for Arkive core.

use crate::resource::ResourceState;
use crate::transaction::TransactionState;
use crate::types::{ResourceId, TransactionId};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Arkive core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Payload storage error.
    #[error("storage error: {0}")]
    Storage(#[from] arkive_storage::StorageError),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Resource does not exist or has been deleted.
    #[error("resource not found: {id}")]
    NotFound {
        /// The resource that was looked up.
        id: ResourceId,
    },

    /// Resource is a tombstone.
    #[error("resource is a tombstone: {id}")]
    Gone {
        /// The tombstoned resource.
        id: ResourceId,
    },

    /// Resource is owned by another transaction.
    #[error("resource {id} is locked by another transaction")]
    Conflict {
        /// The contended resource.
        id: ResourceId,
    },

    /// The presented transaction does not exist (never registered, or
    /// already finished).
    #[error("unknown transaction: {txid}")]
    UnknownTransaction {
        /// The presented transaction id.
        txid: TransactionId,
    },

    /// The transaction exists but no longer accepts work.
    #[error("transaction {txid} is in state {state}")]
    BadTransactionState {
        /// The presented transaction id.
        txid: TransactionId,
        /// Its current state.
        state: TransactionState,
    },

    /// The identifier is already attached to another resource.
    #[error("identifier {identifier} already belongs to {owner}")]
    IdentifierTaken {
        /// The contested identifier.
        identifier: String,
        /// The resource holding it.
        owner: ResourceId,
    },

    /// A stored value could not be interpreted.
    #[error("invalid stored value: {message}")]
    InvalidValue {
        /// Description of the problem.
        message: String,
    },

    /// Configuration could not be loaded.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the problem.
        message: String,
    },
}

impl CoreError {
    /// Creates a not found error.
    pub fn not_found(id: ResourceId) -> Self {
        Self::NotFound { id }
    }

    /// Creates a gone error.
    pub fn gone(id: ResourceId) -> Self {
        Self::Gone { id }
    }

    /// Creates a conflict error.
    pub fn conflict(id: ResourceId) -> Self {
        Self::Conflict { id }
    }

    /// Creates an unknown transaction error.
    pub fn unknown_transaction(txid: TransactionId) -> Self {
        Self::UnknownTransaction { txid }
    }

    /// Creates a bad transaction state error.
    pub fn bad_transaction_state(txid: TransactionId, state: TransactionState) -> Self {
        Self::BadTransactionState { txid, state }
    }

    /// Creates an invalid value error.
    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::InvalidValue {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns the HTTP status code the request layer should answer with.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::NotFound { .. } => 404,
            CoreError::Gone { .. } => 410,
            CoreError::Conflict { .. } | CoreError::IdentifierTaken { .. } => 409,
            CoreError::UnknownTransaction { .. } | CoreError::BadTransactionState { .. } => 400,
            CoreError::Storage(_)
            | CoreError::Database(_)
            | CoreError::InvalidValue { .. }
            | CoreError::Config { .. } => 500,
        }
    }

    /// Returns true if this is a client error (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Returns true if the caller may retry the same request later.
    ///
    /// Only lock conflicts qualify; nothing is retried automatically.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Conflict { .. })
    }
}

/// Maps a resource state to the error an ordinary read should produce.
pub(crate) fn read_guard(id: ResourceId, state: Option<ResourceState>) -> CoreResult<ResourceState> {
    match state {
        Some(ResourceState::Active) => Ok(ResourceState::Active),
        Some(ResourceState::Tombstone) => Err(CoreError::gone(id)),
        Some(ResourceState::Deleted) | None => Err(CoreError::not_found(id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        let id = ResourceId::new(1);
        let txid = TransactionId::new(2);
        assert_eq!(CoreError::not_found(id).status_code(), 404);
        assert_eq!(CoreError::gone(id).status_code(), 410);
        assert_eq!(CoreError::conflict(id).status_code(), 409);
        assert_eq!(CoreError::unknown_transaction(txid).status_code(), 400);
        assert_eq!(
            CoreError::bad_transaction_state(txid, TransactionState::Commit).status_code(),
            400
        );
        assert_eq!(CoreError::invalid_value("x").status_code(), 500);
    }

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(CoreError::conflict(ResourceId::new(1)).is_retryable());
        assert!(!CoreError::not_found(ResourceId::new(1)).is_retryable());
        assert!(CoreError::gone(ResourceId::new(1)).is_client_error());
    }

    #[test]
    fn read_guard_states() {
        let id = ResourceId::new(3);
        assert!(read_guard(id, Some(ResourceState::Active)).is_ok());
        assert!(matches!(
            read_guard(id, Some(ResourceState::Tombstone)),
            Err(CoreError::Gone { .. })
        ));
        assert!(matches!(
            read_guard(id, Some(ResourceState::Deleted)),
            Err(CoreError::NotFound { .. })
        ));
        assert!(matches!(read_guard(id, None), Err(CoreError::NotFound { .. })));
    }
}
