//! Init-db command implementation.

use arkive_core::{db, RepoConfig};
use arkive_storage::PayloadStore;

/// Creates the schema and the payload directories.
pub fn run(config: &RepoConfig) -> Result<(), Box<dyn std::error::Error>> {
    db::open(&config.database)?;
    let payloads = PayloadStore::new(config.storage.clone())?;
    for dir in [&payloads.config().root, &payloads.config().tmp_dir] {
        std::fs::create_dir_all(dir)?;
    }

    println!("database: {}", config.database.path.display());
    println!("payloads: {}", payloads.config().root.display());
    println!("hash:     {}", payloads.algorithm());
    Ok(())
}
