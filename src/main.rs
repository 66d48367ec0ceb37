//! blocksync CLI
//!
//! Indexes transactions, addresses and rich lists from a Bitcoin-compatible
//! node into SQLite, spreading the height scan over worker processes.

use anyhow::Result;
use blocksync::runtime::error::find_sync_error;
use blocksync::worker::run_worker_process;
use blocksync::{init_tracing, Runner, SyncConfig, SyncConfigParams, SyncError, SyncMode};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "blocksync")]
#[command(about = "Sync block-derived index data into SQLite", long_about = None)]
struct Cli {
    /// SQLite database URL (defaults to BLOCKSYNC_DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Maximum number of concurrent workers
    #[arg(long, global = true)]
    pool_size: Option<usize>,

    /// Maximum heights assigned to one worker
    #[arg(long, global = true)]
    max_per_worker: Option<u64>,

    /// Run the whole work set in a single worker
    #[arg(long, global = true)]
    no_pooling: bool,

    /// Directory holding the single-instance lock files
    #[arg(long, global = true)]
    lock_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync the transaction and address index
    Index {
        #[arg(value_enum)]
        mode: IndexMode,
    },

    /// Process one assignment read from stdin (spawned by `index`)
    #[command(hide = true)]
    Worker,
}

#[derive(Clone, Copy, ValueEnum)]
enum IndexMode {
    /// Sync from the last checkpoint to the ledger tip
    Update,
    /// Re-sync heights at or below the checkpoint that have no records
    Check,
    /// Clear all derived data and sync from height 1
    Reindex,
    /// Report how many heights `check` would re-sync
    CountMissing,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            let code = find_sync_error(&err).map_or(1, SyncError::exit_code);
            tracing::error!(error = %format!("{err:#}"), "blocksync failed");
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Worker => {
            run_worker_process(&config).await?;
            Ok(0)
        }
        Commands::Index { mode } => {
            let mut runner = Runner::from_config(config)?;
            let outcome = match mode {
                IndexMode::Update => runner.run_until_signal(SyncMode::Update).await?,
                IndexMode::Check => runner.run_until_signal(SyncMode::Check).await?,
                IndexMode::Reindex => runner.run_until_signal(SyncMode::Reindex).await?,
                IndexMode::CountMissing => runner.count_missing().await?,
            };
            Ok(u8::try_from(outcome.exit_code()).unwrap_or(1))
        }
    }
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut params = SyncConfigParams::from_env()?;

    // Apply overrides
    if let Some(url) = &cli.database_url {
        params.database_url = url.clone();
    }
    if let Some(pool_size) = cli.pool_size {
        params.pool_size = pool_size;
    }
    if let Some(cap) = cli.max_per_worker {
        params.max_per_worker = cap;
    }
    if cli.no_pooling {
        params.pooling = false;
    }
    if let Some(dir) = &cli.lock_dir {
        params.lock_dir = dir.clone();
    }

    SyncConfig::new(params)
}
