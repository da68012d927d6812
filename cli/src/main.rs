//! AddrIndex CLI — inspect index state and query address history.
//!
//! # Commands
//! ```
//! addrindex status  [--db <path>]
//! addrindex history --address <addr> [--db <path>]
//! addrindex check-config --file <addrindex.toml>
//! addrindex info
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use addrindex_core::event::EventBus;
use addrindex_engine::EngineConfig;
use addrindex_storage::sqlite::SqliteStore;
use addrindex_storage::LedgerStore;

#[derive(Parser)]
#[command(
    name = "addrindex",
    about = "Reorg-safe address-history index — AddrIndex CLI",
    version
)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the indexed tip and unconfirmed-transaction count
    Status {
        /// SQLite database path (overrides the config file)
        #[arg(long)]
        db: Option<String>,
        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the history rows for an address
    History {
        /// Address to query
        #[arg(short, long)]
        address: String,
        /// SQLite database path (overrides the config file)
        #[arg(long)]
        db: Option<String>,
    },
    /// Validate a config file and print the resolved settings
    CheckConfig {
        /// Path to the .toml file
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Show AddrIndex defaults
    Info,
}

/// On-disk configuration: storage location plus engine tunables.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    db_path: Option<String>,
    engine: EngineConfig,
}

impl FileConfig {
    fn load(path: &PathBuf) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let file_config = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    match cli.command {
        Commands::Status { db, json } => cmd_status(resolve_db(db, &file_config)?, json).await,
        Commands::History { address, db } => {
            cmd_history(resolve_db(db, &file_config)?, &address).await
        }
        Commands::CheckConfig { file } => cmd_check_config(&file),
        Commands::Info => {
            cmd_info();
            Ok(())
        }
    }
}

fn resolve_db(flag: Option<String>, config: &FileConfig) -> Result<String> {
    flag.or_else(|| config.db_path.clone())
        .context("no database path; pass --db or set db_path in the config file")
}

async fn cmd_status(db: String, json: bool) -> Result<()> {
    let store = SqliteStore::open(&db, EventBus::default()).await?;
    let tip = store.latest_block().await?;
    let unconfirmed = store.unconfirmed_txids().await?;

    if json {
        let tip = if tip.is_empty() { None } else { Some(&tip) };
        let status = serde_json::json!({
            "tip": tip,
            "unconfirmed": unconfirmed.len(),
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    if tip.is_empty() {
        println!("chain: empty (nothing indexed yet)");
    } else {
        println!("tip:   {} @ {}", tip.hash, tip.height);
    }
    println!("unconfirmed transactions: {}", unconfirmed.len());
    Ok(())
}

async fn cmd_history(db: String, address: &str) -> Result<()> {
    let store = SqliteStore::open(&db, EventBus::default()).await?;
    let rows = store.history(address).await?;

    if rows.is_empty() {
        println!("no history for {address}");
        return Ok(());
    }
    for row in rows {
        let confirmed = match row.output_height {
            Some(height) => format!("height {height}"),
            None => "unconfirmed".to_string(),
        };
        let spent = match (&row.input_txid, row.input_height) {
            (Some(txid), Some(height)) => format!("spent by {txid} at height {height}"),
            (Some(txid), None) => format!("spent by {txid} (mempool)"),
            (None, _) => "unspent".to_string(),
        };
        println!(
            "{}:{}  {} sat  {}  {}",
            row.output_txid, row.output_index, row.value, confirmed, spent
        );
    }
    Ok(())
}

fn cmd_check_config(file: &PathBuf) -> Result<()> {
    let config = FileConfig::load(file)?;
    println!("config ok");
    println!("  db_path: {}", config.db_path.as_deref().unwrap_or("(unset)"));
    println!("  network: {}", config.engine.network);
    println!("  tx workers: {}", config.engine.tx_workers);
    println!("  rebroadcast before evict: {}", config.engine.rebroadcast);
    println!("  send timeout: {}s", config.engine.send_timeout_secs);
    Ok(())
}

fn cmd_info() {
    println!("AddrIndex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default network: livenet");
    println!("  Default unconfirmed-import workers: 4");
    println!("  Default mempool eviction chunk: 250 txids");
    println!("  Default send timeout: 30 minutes");
    println!("  Storage backends: memory, SQLite (feature: sqlite)");
}
