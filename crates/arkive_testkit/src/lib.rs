//! # Arkive Testkit
//!
//! Test utilities for Arkive.
//!
//! This crate provides:
//! - Temporary repositories (database plus payload store) with short timeouts
//! - Seeding helpers that leave committed, unowned resources behind
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use arkive_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_repo() {
//!     with_temp_repo(|repo| {
//!         let id = repo.seed("title", b"payload");
//!         // ... test operations
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
