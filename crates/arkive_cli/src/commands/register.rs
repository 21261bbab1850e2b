//! Register command implementation.

use arkive_coordinator::register_transaction;
use arkive_core::RepoConfig;
use std::time::Duration;

/// Registers a transaction and prints its id on stdout.
pub async fn run(
    config: &RepoConfig,
    timeout_secs: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let timeout = timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.transactions.registration_timeout());
    let txid = register_transaction(&config.coordinator.listen, timeout).await?;
    println!("{}", txid.as_u64());
    Ok(())
}
