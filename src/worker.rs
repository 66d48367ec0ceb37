//! Worker side of the coordinator/worker split: a [`WorkerUnit`] walks one
//! assignment and reports through a [`SignalSink`].

pub(crate) mod backoff;
pub mod derive;
pub mod signal;
pub mod sink;
pub mod unit;

pub use derive::{derive_records, DerivedBlock, DerivedTransaction};
pub use signal::{WorkerId, WorkerLaunch, WorkerSignal};
pub use sink::{ChannelSink, SignalSink, StdoutSink};
pub use unit::{UnitReport, WorkerUnit};

use crate::chain::ChainReader;
use crate::rpc::RpcChainReader;
use crate::runtime::config::SyncConfig;
use crate::store::{SqliteStore, SyncStore};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Entry point of the `worker` subcommand: reads the launch line from stdin,
/// opens its own ledger and store connections, and runs the unit.
pub async fn run_worker_process(config: &SyncConfig) -> Result<UnitReport> {
    let mut line = String::new();
    let read = BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("failed to read worker launch parameters")?;
    if read == 0 {
        bail!("worker stdin closed before launch parameters arrived");
    }
    let launch = WorkerLaunch::decode(&line)?;

    let chain: Arc<dyn ChainReader> = Arc::new(RpcChainReader::from_config(config)?);
    let store = SqliteStore::connect_with_max_connections(config.database_url(), 1)?;
    store.prepare().await.context("worker could not open the store")?;
    let store: Arc<dyn SyncStore> = Arc::new(store);

    let unit = WorkerUnit::new(chain, store, config);
    let mut sink = StdoutSink::new();
    unit.run(&launch, &mut sink)
        .await
        .with_context(|| format!("worker {} aborted", launch.id))
}
