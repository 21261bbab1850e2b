//! CLI command implementations.

pub mod init_db;
pub mod register;
pub mod serve;
pub mod status;
pub mod sweep;
