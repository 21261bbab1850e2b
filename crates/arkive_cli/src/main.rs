//! Arkive CLI
//!
//! The `arkive` binary: runs the transaction coordinator and offers small
//! maintenance tools.
//!
//! # Commands
//!
//! - `serve` - Run the coordinator until SIGTERM/SIGINT; SIGHUP reloads the configuration
//! - `register` - Register a transaction and print its id
//! - `status` - Show the row of a transaction
//! - `sweep` - Release stale transactions left behind by a dead coordinator
//! - `init-db` - Create the database schema and storage directories

mod commands;

use arkive_core::{RepoConfig, TransactionId};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Arkive transaction coordinator and repository tools.
#[derive(Parser)]
#[command(name = "arkive")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the transaction coordinator
    Serve,

    /// Register a new transaction and print its id
    Register {
        /// Seconds to wait for the coordinator to answer
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Show the state of a transaction
    Status {
        /// Transaction id (`123` or `txn:123`)
        txid: TransactionId,
    },

    /// Release stale transactions that no coordinator supervises.
    /// Only run this while no coordinator is serving the repository.
    Sweep {
        /// List stale transactions without releasing them
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Create the database schema and storage directories
    InitDb,
}

fn load_config(path: Option<&Path>) -> Result<RepoConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(RepoConfig::load(path)?),
        None => Ok(RepoConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => commands::serve::run(config, cli.config).await?,
        Commands::Register { timeout } => commands::register::run(&config, timeout).await?,
        Commands::Status { txid } => commands::status::run(&config, txid)?,
        Commands::Sweep { dry_run } => commands::sweep::run(&config, dry_run)?,
        Commands::InitDb => commands::init_db::run(&config)?,
    }

    Ok(())
}
