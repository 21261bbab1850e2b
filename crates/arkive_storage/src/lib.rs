//! # Arkive Storage
//!
//! Binary payload store for Arkive resources.
//!
//! Payloads are plain files addressed by resource id through a fixed-depth,
//! fixed-fan-out directory shard. This crate knows nothing about the
//! database or about transactions beyond the numeric suffix used for
//! backups.
//!
//! ## Design Principles
//!
//! - Path derivation is a pure function of id and depth
//! - Uploads land in a temporary file and are renamed into place
//! - Backup and restore are renames, never copies
//! - At most one of {live file, backup for a transaction} exists at a time
//!
//! ## Example
//!
//! ```rust,no_run
//! use arkive_storage::{PayloadConfig, PayloadStore};
//!
//! let store = PayloadStore::new(PayloadConfig::new("/srv/payloads")).unwrap();
//! let upload = store.upload(1, &b"hello world"[..]).unwrap();
//! assert_eq!(upload.size, 11);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod digest;
mod error;
mod payload;
pub mod shard;

pub use config::PayloadConfig;
pub use digest::{HashAlgorithm, PayloadHasher};
pub use error::{StorageError, StorageResult};
pub use payload::{PayloadStore, Upload};
