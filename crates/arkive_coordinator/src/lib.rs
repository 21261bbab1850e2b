//! # Arkive Coordinator
//!
//! The process that owns the lifetime of every transaction.
//!
//! This crate provides:
//! - The coordinator server: one worker task per registered transaction,
//!   a supervisor for dead workers and a sweeper for stale rows
//! - The reconciler that commits (history append) or rolls back (restore
//!   from the pinned snapshot) a finished transaction
//! - The registration client and a [`TransactionClient`] for request
//!   handlers
//!
//! ## Protocol
//!
//! A client connects to the coordinator socket and reads one line holding
//! the decimal transaction id. Everything else happens through the
//! `transactions` table: heartbeats update `last_request`, commit and
//! rollback requests flip `state`, and the worker polls the row.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod client;
mod error;
mod listener;
mod reconciler;
mod registry;
mod server;
mod worker;

pub use client::{register_transaction, TransactionClient};
pub use error::{CoordinatorError, CoordinatorResult};
pub use reconciler::{Outcome, Reconciler, RollbackReason, Summary};
pub use server::{sweep, Coordinator, CoordinatorHandle};
