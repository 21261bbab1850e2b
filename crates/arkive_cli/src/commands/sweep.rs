//! Sweep command implementation.

use arkive_coordinator::{sweep, Reconciler};
use arkive_core::transaction::table;
use arkive_core::{db, RepoConfig};
use arkive_storage::PayloadStore;

/// Releases stale transactions, or lists them with `dry_run`.
pub fn run(config: &RepoConfig, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    if dry_run {
        let conn = db::open(&config.database)?;
        let stale = table::stale(&conn, config.transactions.timeout())?;
        for record in &stale {
            println!("{} {} idle {:?}", record.id, record.state, record.idle_for());
        }
        println!("{} stale transaction(s)", stale.len());
        return Ok(());
    }

    let payloads = PayloadStore::new(config.storage.clone())?;
    let reconciler = Reconciler::new(payloads, config.schema.clone());
    let released = sweep(config, &reconciler, |_| false)?;
    for txid in &released {
        println!("released {txid}");
    }
    println!("{} stale transaction(s) released", released.len());
    Ok(())
}
