//! Status command implementation.

use arkive_core::transaction::table;
use arkive_core::{db, RepoConfig, TransactionId};

/// Prints the row of `txid`, or that it has finished.
pub fn run(config: &RepoConfig, txid: TransactionId) -> Result<(), Box<dyn std::error::Error>> {
    let conn = db::open(&config.database)?;
    let Some(record) = table::get(&conn, txid)? else {
        println!("{txid}: finished (no such transaction)");
        return Ok(());
    };

    let owned = table::owned_resources(&conn, txid)?;
    println!("{txid}");
    println!("  state:        {}", record.state);
    println!("  started:      {}", record.started);
    println!("  last request: {} ({:?} ago)", record.last_request, record.idle_for());
    println!("  resources:    {}", owned.len());
    if record.is_expired(config.transactions.timeout()) {
        println!("  expired:      yes");
    }
    Ok(())
}
