use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use blocksync::chain::{ChainReader, LedgerBlock, MemoryChain};
use blocksync::job::{Assignment, SyncMode};
use blocksync::store::{
    AddressLink, AddressRecord, Checkpoint, MemoryStore, RankingEntry, RankingKind, RecordCounts,
    StoreFuture, SyncStore, TransactionRecord,
};
use blocksync::worker::{ChannelSink, WorkerLaunch, WorkerUnit};
use blocksync::{SyncConfig, SyncConfigBuilder};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use std::collections::BTreeSet;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Builder preset with fast retries and short reporter intervals. The RPC
/// endpoint is never dialled by in-process runs.
pub fn test_config(lock_dir: &Path) -> SyncConfigBuilder {
    SyncConfig::builder()
        .rpc_url("http://127.0.0.1:1")
        .rpc_user("user")
        .rpc_password("pass")
        .database_url("sqlite::memory:")
        .lock_dir(lock_dir)
        .max_per_worker(50)
        .pool_size(4)
        .progress_interval(Duration::from_millis(10))
        .metrics_interval(Duration::from_millis(50))
        .fetch_attempts(3)
        .fetch_backoff(Duration::from_millis(1), Duration::from_millis(2))
}

/// Heights `1..=tip` of a [`MemoryChain`] hold one coinbase at height 1 and
/// two transactions from height 2 on.
pub fn expected_transactions(first: u64, last: u64) -> u64 {
    (first..=last).map(|h| if h == 1 { 1 } else { 2 }).sum()
}

/// Commits `heights` into `store` directly through a worker unit.
pub async fn sync_heights(
    chain: &MemoryChain,
    store: Arc<dyn SyncStore>,
    config: &SyncConfig,
    heights: Vec<u64>,
) {
    let unit = WorkerUnit::new(Arc::new(chain.clone()), store, config);
    let (tx, mut rx) = mpsc::channel(1024);
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
    let mut sink = ChannelSink::new(tx);
    let launch = WorkerLaunch {
        id: 1,
        worker_index: 0,
        mode: SyncMode::Update,
        assignment: Assignment::Heights { heights },
    };
    unit.run(&launch, &mut sink).await.unwrap();
    drop(sink);
    drain.await.unwrap();
}

/// [`MemoryChain`] wrapper that can hang fetches or lose the tip query.
#[derive(Clone)]
pub struct ScriptedChain {
    inner: MemoryChain,
    hang_once: Arc<Mutex<HashSet<u64>>>,
    hang_always: Arc<Mutex<HashSet<u64>>>,
    unavailable: Arc<AtomicBool>,
}

impl ScriptedChain {
    pub fn new(inner: MemoryChain) -> Self {
        Self {
            inner,
            hang_once: Arc::default(),
            hang_always: Arc::default(),
            unavailable: Arc::default(),
        }
    }

    /// The first fetch of `height` never resolves.
    pub fn hang_once(&self, height: u64) {
        self.hang_once.lock().unwrap().insert(height);
    }

    pub fn hang_always(&self, height: u64) {
        self.hang_always.lock().unwrap().insert(height);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl ChainReader for ScriptedChain {
    fn current_height(&self) -> BoxFuture<'_, anyhow::Result<u64>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Box::pin(async { Err::<u64, _>(anyhow!("connection refused")) });
        }
        self.inner.current_height()
    }

    fn fetch_block(&self, height: u64) -> BoxFuture<'_, anyhow::Result<LedgerBlock>> {
        let hang = self.hang_once.lock().unwrap().remove(&height)
            || self.hang_always.lock().unwrap().contains(&height);
        if hang {
            return Box::pin(futures::future::pending());
        }
        self.inner.fetch_block(height)
    }
}

/// [`MemoryStore`] wrapper counting aggregate writes, with switchable
/// failures.
#[derive(Clone, Default)]
pub struct CountingStore {
    inner: MemoryStore,
    checkpoint_writes: Arc<AtomicUsize>,
    ranking_updates: Arc<AtomicUsize>,
    run_records: Arc<AtomicUsize>,
    fail_prepare: Arc<AtomicBool>,
    fail_counts: Arc<AtomicBool>,
}

impl CountingStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn checkpoint_writes(&self) -> usize {
        self.checkpoint_writes.load(Ordering::SeqCst)
    }

    pub fn ranking_updates(&self) -> usize {
        self.ranking_updates.load(Ordering::SeqCst)
    }

    pub fn run_records(&self) -> usize {
        self.run_records.load(Ordering::SeqCst)
    }

    pub fn fail_prepare(&self, fail: bool) {
        self.fail_prepare.store(fail, Ordering::SeqCst);
    }

    pub fn fail_counts(&self, fail: bool) {
        self.fail_counts.store(fail, Ordering::SeqCst);
    }
}

impl SyncStore for CountingStore {
    fn prepare(&self) -> StoreFuture<'_, ()> {
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Box::pin(async { Err::<(), _>(anyhow!("unable to open database file")) });
        }
        self.inner.prepare()
    }

    fn read_checkpoint(&self) -> StoreFuture<'_, Checkpoint> {
        self.inner.read_checkpoint()
    }

    fn write_checkpoint(&self, height: u64) -> StoreFuture<'_, ()> {
        self.checkpoint_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write_checkpoint(height)
    }

    fn record_run(&self, at: DateTime<Utc>) -> StoreFuture<'_, ()> {
        self.run_records.fetch_add(1, Ordering::SeqCst);
        self.inner.record_run(at)
    }

    fn upsert_transaction<'a>(&'a self, record: &'a TransactionRecord) -> StoreFuture<'a, ()> {
        self.inner.upsert_transaction(record)
    }

    fn upsert_address<'a>(&'a self, record: &'a AddressRecord) -> StoreFuture<'a, ()> {
        self.inner.upsert_address(record)
    }

    fn upsert_address_link<'a>(&'a self, link: &'a AddressLink) -> StoreFuture<'a, ()> {
        self.inner.upsert_address_link(link)
    }

    fn delete_all_derived(&self) -> StoreFuture<'_, ()> {
        self.inner.delete_all_derived()
    }

    fn read_distinct_recorded_heights(&self) -> StoreFuture<'_, BTreeSet<u64>> {
        self.inner.read_distinct_recorded_heights()
    }

    fn top_addresses(&self, kind: RankingKind, limit: usize) -> StoreFuture<'_, Vec<RankingEntry>> {
        self.inner.top_addresses(kind, limit)
    }

    fn update_ranking<'a>(
        &'a self,
        kind: RankingKind,
        entries: &'a [RankingEntry],
    ) -> StoreFuture<'a, ()> {
        self.ranking_updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update_ranking(kind, entries)
    }

    fn read_ranking(&self, kind: RankingKind) -> StoreFuture<'_, Vec<RankingEntry>> {
        self.inner.read_ranking(kind)
    }

    fn count_transactions(&self) -> StoreFuture<'_, u64> {
        if self.fail_counts.load(Ordering::SeqCst) {
            return Box::pin(async { Err::<u64, _>(anyhow!("database disk image is malformed")) });
        }
        self.inner.count_transactions()
    }

    fn count_addresses(&self) -> StoreFuture<'_, u64> {
        self.inner.count_addresses()
    }

    fn write_counts(&self, counts: RecordCounts) -> StoreFuture<'_, ()> {
        self.inner.write_counts(counts)
    }

    fn read_counts(&self) -> StoreFuture<'_, RecordCounts> {
        self.inner.read_counts()
    }
}
