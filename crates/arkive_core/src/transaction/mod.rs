//! Transaction bookkeeping.
//!
//! A transaction is a row in the `transactions` table. Resources point at
//! the transaction that owns them through `resources.transaction_id`; the
//! coordinator removes the row once it has reconciled the transaction.

mod state;
pub mod table;

pub use state::{TransactionRecord, TransactionState};
