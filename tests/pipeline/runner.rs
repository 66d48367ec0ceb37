use std::sync::Arc;
use std::time::Duration;

use crate::support::helpers::{
    expected_transactions, init_tracing, sync_heights, test_config, CountingStore, ScriptedChain,
};
use blocksync::chain::{ChainReader, MemoryChain};
use blocksync::coordinator::lock::LockManager;
use blocksync::job::{SyncMode, INDEX_JOB_KIND};
use blocksync::runtime::error::find_sync_error;
use blocksync::store::{MemoryStore, RankingKind, SyncStore, TransactionRecord};
use blocksync::{RunOutcome, RunPhase, Runner, SyncConfig, SyncError, TaskSpawner};
use tempfile::{tempdir, TempDir};

struct Harness {
    _dir: TempDir,
    locks: LockManager,
    config: SyncConfig,
    store: CountingStore,
}

impl Harness {
    fn new(configure: impl FnOnce(blocksync::SyncConfigBuilder) -> blocksync::SyncConfigBuilder) -> Self {
        init_tracing();
        let dir = tempdir().unwrap();
        let config = configure(test_config(dir.path())).build().unwrap();
        Self {
            locks: LockManager::new(dir.path()),
            _dir: dir,
            config,
            store: CountingStore::new(MemoryStore::new()),
        }
    }

    fn runner<C: ChainReader + Clone + 'static>(&self, chain: &C) -> Runner {
        let chain: Arc<dyn ChainReader> = Arc::new(chain.clone());
        let store: Arc<dyn SyncStore> = Arc::new(self.store.clone());
        let spawner = TaskSpawner::new(Arc::clone(&chain), Arc::clone(&store), self.config.clone());
        Runner::new(self.config.clone(), chain, store, Box::new(spawner))
    }

    fn lock_is_free(&self) -> bool {
        self.locks.acquire(INDEX_JOB_KIND).is_ok()
    }

    async fn checkpoint(&self) -> u64 {
        self.store.read_checkpoint().await.unwrap().last_synced_height
    }
}

fn completed(outcome: RunOutcome) -> blocksync::FinalizeReport {
    match outcome {
        RunOutcome::Completed(report) => report,
        other => panic!("expected a completed run, got {other:?}"),
    }
}

#[tokio::test]
async fn update_from_checkpoint_syncs_to_tip_and_finalizes_once() {
    let harness = Harness::new(|b| b.max_per_worker(50).pool_size(4));
    harness.store.inner().seed_checkpoint(900).await;
    let chain = MemoryChain::new(1_000);
    let mut runner = harness.runner(&chain);

    let outcome = runner.run(SyncMode::Update).await.unwrap();
    assert_eq!(outcome.exit_code(), 0);
    let report = completed(outcome);

    assert_eq!(report.checkpoint, 1_000);
    assert_eq!(report.counts.transactions, expected_transactions(901, 1_000));
    assert_eq!(harness.checkpoint().await, 1_000);
    assert_eq!(harness.store.checkpoint_writes(), 1);
    assert_eq!(harness.store.ranking_updates(), 2);
    assert_eq!(harness.store.run_records(), 1);

    let heights = harness.store.read_distinct_recorded_heights().await.unwrap();
    assert_eq!(heights.into_iter().collect::<Vec<_>>(), (901..=1_000).collect::<Vec<_>>());

    let snapshot = runner.telemetry().snapshot();
    assert_eq!(snapshot.workers_spawned, 2);
    assert_eq!(snapshot.processed_heights, 100);
    assert_eq!(snapshot.respawns, 0);
    assert!(harness.lock_is_free());
}

#[tokio::test]
async fn rankings_are_rebuilt_from_links() {
    let harness = Harness::new(|b| b.richlist_size(3));
    let chain = MemoryChain::with_address_ring(40, 4);
    let mut runner = harness.runner(&chain);

    completed(runner.run(SyncMode::Update).await.unwrap());

    let received = harness.store.read_ranking(RankingKind::Received).await.unwrap();
    let balance = harness.store.read_ranking(RankingKind::Balance).await.unwrap();
    assert_eq!(received.len(), 3);
    assert_eq!(balance.len(), 3);
    assert!(received
        .windows(2)
        .all(|pair| pair[0].received_sats >= pair[1].received_sats));
    assert!(balance
        .windows(2)
        .all(|pair| pair[0].balance_sats >= pair[1].balance_sats));
    for entry in &balance {
        assert_eq!(
            entry.balance_sats,
            entry.received_sats as i64 - entry.sent_sats as i64
        );
    }
}

#[tokio::test]
async fn up_to_date_store_has_nothing_to_do() {
    let harness = Harness::new(|b| b);
    harness.store.inner().seed_checkpoint(500).await;
    let chain = MemoryChain::new(500);
    let mut runner = harness.runner(&chain);

    let outcome = runner.run(SyncMode::Update).await.unwrap();
    assert_eq!(outcome, RunOutcome::NothingToDo);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(runner.telemetry().snapshot().workers_spawned, 0);
    assert_eq!(harness.store.checkpoint_writes(), 0);
    assert!(harness.lock_is_free());
}

#[tokio::test]
async fn check_mode_fills_only_missing_heights() {
    let harness = Harness::new(|b| b.max_per_worker(2).pool_size(4));
    let chain = MemoryChain::new(60);
    let present: Vec<u64> = (1..=50).filter(|h| ![5, 17, 42].contains(h)).collect();
    sync_heights(&chain, Arc::new(harness.store.clone()), &harness.config, present).await;
    harness.store.inner().seed_checkpoint(50).await;

    let mut runner = harness.runner(&chain);
    assert_eq!(runner.count_missing().await.unwrap(), RunOutcome::MissingCount(3));

    let report = completed(runner.run(SyncMode::Check).await.unwrap());
    assert_eq!(report.checkpoint, 50, "check never moves past the checkpoint");
    assert_eq!(runner.telemetry().snapshot().workers_spawned, 2);

    let heights = harness.store.read_distinct_recorded_heights().await.unwrap();
    assert_eq!(heights.into_iter().collect::<Vec<_>>(), (1..=50).collect::<Vec<_>>());
    assert_eq!(runner.count_missing().await.unwrap(), RunOutcome::MissingCount(0));
    assert_eq!(
        harness.store.count_transactions().await.unwrap(),
        expected_transactions(1, 50)
    );
}

#[tokio::test]
async fn check_with_no_gaps_has_nothing_to_do() {
    let harness = Harness::new(|b| b);
    let chain = MemoryChain::new(20);
    sync_heights(&chain, Arc::new(harness.store.clone()), &harness.config, (1..=20).collect()).await;
    harness.store.inner().seed_checkpoint(20).await;

    let mut runner = harness.runner(&chain);
    assert_eq!(runner.run(SyncMode::Check).await.unwrap(), RunOutcome::NothingToDo);
}

#[tokio::test]
async fn reindex_clears_derived_state_and_rebuilds_from_height_one() {
    let harness = Harness::new(|b| b.max_per_worker(10).pool_size(3));
    harness.store.inner().seed_checkpoint(5_000).await;
    harness
        .store
        .upsert_transaction(&TransactionRecord {
            txid: "stale".into(),
            height: 4_999,
            block_hash: "00".into(),
            timestamp: 0,
            inputs: Vec::new(),
            outputs: Vec::new(),
            total_sats: 1,
        })
        .await
        .unwrap();
    let chain = MemoryChain::new(30);
    let mut runner = harness.runner(&chain);

    let report = completed(runner.run(SyncMode::Reindex).await.unwrap());
    assert_eq!(report.checkpoint, 30);
    assert_eq!(report.counts.transactions, expected_transactions(1, 30));
    assert_eq!(harness.store.checkpoint_writes(), 2, "reset to 0, then finalize");

    let heights = harness.store.read_distinct_recorded_heights().await.unwrap();
    assert!(!heights.contains(&4_999));
    assert_eq!(heights.len(), 30);
}

#[tokio::test]
async fn held_lock_means_already_running() {
    let harness = Harness::new(|b| b);
    let _held = harness.locks.acquire(INDEX_JOB_KIND).unwrap();
    let chain = MemoryChain::new(10);
    let mut runner = harness.runner(&chain);

    for mode in [SyncMode::Update, SyncMode::Check, SyncMode::Reindex] {
        let outcome = runner.run(mode).await.unwrap();
        assert_eq!(outcome, RunOutcome::AlreadyRunning);
        assert_eq!(outcome.exit_code(), 0);
    }
    assert_eq!(runner.telemetry().snapshot().workers_spawned, 0);
    assert_eq!(harness.store.checkpoint_writes(), 0);
}

#[tokio::test]
async fn unreachable_store_aborts_before_planning() {
    let harness = Harness::new(|b| b);
    harness.store.fail_prepare(true);
    let chain = MemoryChain::new(10);
    let mut runner = harness.runner(&chain);

    let err = runner.run(SyncMode::Update).await.unwrap_err();
    let sync_error = find_sync_error(&err).unwrap();
    assert_eq!(sync_error, &SyncError::StoreUnreachable);
    assert_eq!(sync_error.exit_code(), 1);
    assert_eq!(runner.telemetry().snapshot().workers_spawned, 0);
    assert!(harness.lock_is_free());
}

#[tokio::test]
async fn unavailable_chain_is_reported() {
    let harness = Harness::new(|b| b);
    let chain = ScriptedChain::new(MemoryChain::new(10));
    chain.set_unavailable(true);
    let mut runner = harness.runner(&chain);

    let err = runner.run(SyncMode::Update).await.unwrap_err();
    assert_eq!(find_sync_error(&err), Some(&SyncError::ChainUnavailable));
    assert!(harness.lock_is_free());
}

#[tokio::test]
async fn failed_finalize_keeps_checkpoint_and_rerun_recovers() {
    let harness = Harness::new(|b| b);
    harness.store.inner().seed_checkpoint(900).await;
    harness.store.fail_counts(true);
    let chain = MemoryChain::new(1_000);
    let mut runner = harness.runner(&chain);

    let err = runner.run(SyncMode::Update).await.unwrap_err();
    assert_eq!(
        find_sync_error(&err),
        Some(&SyncError::FinalizeFailed { stage: "counts" })
    );
    assert_eq!(harness.checkpoint().await, 900);
    assert_eq!(harness.store.checkpoint_writes(), 0);
    assert!(harness.lock_is_free());

    harness.store.fail_counts(false);
    let report = completed(runner.run(SyncMode::Update).await.unwrap());
    assert_eq!(report.checkpoint, 1_000);
    assert_eq!(report.counts.transactions, expected_transactions(901, 1_000));
}

#[tokio::test]
async fn stalled_worker_is_replaced_by_a_continuation() {
    let harness = Harness::new(|b| {
        b.max_per_worker(20)
            .pool_size(2)
            .stall_threshold(Duration::from_millis(300))
            .supervisor_tick(Duration::from_millis(50))
    });
    let chain = ScriptedChain::new(MemoryChain::new(40));
    chain.hang_once(12);
    let mut runner = harness.runner(&chain);

    let report = completed(runner.run(SyncMode::Update).await.unwrap());
    assert_eq!(report.checkpoint, 40);
    assert_eq!(report.counts.transactions, expected_transactions(1, 40));

    let snapshot = runner.telemetry().snapshot();
    assert_eq!(snapshot.stalls, 1);
    assert_eq!(snapshot.respawns, 1);
    assert_eq!(snapshot.workers_spawned, 3);

    assert_eq!(
        runner.phase_history(),
        &[
            RunPhase::Idle,
            RunPhase::Locked,
            RunPhase::Planning,
            RunPhase::Scheduling,
            RunPhase::Stalling,
            RunPhase::Recovering,
            RunPhase::Scheduling,
            RunPhase::Finalizing,
            RunPhase::Done,
        ]
    );
}

#[tokio::test]
async fn crashed_worker_resumes_without_waiting_for_stall() {
    let harness = Harness::new(|b| {
        b.max_per_worker(20)
            .pool_size(2)
            .stall_threshold(Duration::from_secs(60))
    });
    let chain = MemoryChain::new(40);
    chain.fail_height(25, 3).await;
    let mut runner = harness.runner(&chain);

    let report = tokio::time::timeout(Duration::from_secs(10), runner.run(SyncMode::Update))
        .await
        .expect("recovery must not wait for the stall threshold")
        .unwrap();
    let report = completed(report);
    assert_eq!(report.checkpoint, 40);

    let snapshot = runner.telemetry().snapshot();
    assert_eq!(snapshot.crashes, 1);
    assert_eq!(snapshot.respawns, 1);
    assert_eq!(snapshot.stalls, 0);
    assert_eq!(chain.fetch_count(25).await, 4);
}

#[tokio::test]
async fn exhausted_recoveries_leave_run_incomplete() {
    let harness = Harness::new(|b| b.max_per_worker(20).pool_size(2).max_recoveries(1));
    harness.store.inner().seed_checkpoint(0).await;
    let chain = MemoryChain::new(40);
    chain.fail_height(30, usize::MAX).await;
    let mut runner = harness.runner(&chain);

    let outcome = runner.run(SyncMode::Update).await.unwrap();
    assert_eq!(outcome, RunOutcome::Incomplete { abandoned: 1 });
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(harness.checkpoint().await, 0);
    assert_eq!(harness.store.checkpoint_writes(), 0);
    assert_eq!(runner.telemetry().snapshot().abandoned_partitions, 1);
    assert!(harness.lock_is_free());

    let heights = harness.store.read_distinct_recorded_heights().await.unwrap();
    assert!((1..=29).all(|h| heights.contains(&h)));
}

#[tokio::test]
async fn cancellation_aborts_without_finalizing() {
    let harness = Harness::new(|b| b.max_per_worker(10).pool_size(2));
    let chain = ScriptedChain::new(MemoryChain::new(40));
    chain.hang_always(5);
    let mut runner = harness.runner(&chain);
    let token = runner.cancellation_token();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
    });

    let outcome = runner.run(SyncMode::Update).await.unwrap();
    assert_eq!(outcome, RunOutcome::Cancelled);
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(harness.store.checkpoint_writes(), 0);
    assert_eq!(harness.store.run_records(), 0);
    assert!(harness.lock_is_free());
}
