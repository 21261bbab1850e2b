//! # Arkive Core
//!
//! Resource state machine and transaction bookkeeping for Arkive.
//!
//! This crate provides:
//! - The SQLite schema, connection setup and pinned read snapshots
//! - The `transactions` table (registration, heartbeat, completion requests)
//! - Resource ownership, lifecycle transitions and payload writes
//! - Identifier, relation and metadata row access
//! - Repository configuration
//!
//! The database is the only lock manager: a resource belongs to at most one
//! transaction through its `transaction_id` column, and writers that find it
//! taken get [`CoreError::Conflict`] instead of waiting.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod config;
pub mod db;
mod error;
pub mod metadata;
mod resource;
pub mod transaction;
mod types;

pub use config::{
    CoordinatorConfig, DatabaseConfig, Endpoint, PayloadConfig, RepoConfig, SchemaConfig,
    TransactionConfig,
};
pub use db::Snapshot;
pub use error::{CoreError, CoreResult};
pub use metadata::{IdentifierRow, MetadataRow, RelationRow, ResourceRows, Triple};
pub use resource::{AcquireMode, ResourceState, ResourceStore};
pub use transaction::{TransactionRecord, TransactionState};
pub use types::{age_of, now_millis, ResourceId, TransactionId};
