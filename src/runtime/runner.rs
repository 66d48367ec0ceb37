use crate::chain::ChainReader;
use crate::coordinator::finalize::{FinalizeReport, Finalizer};
use crate::coordinator::lock::LockManager;
use crate::coordinator::plan::{PartitionPlan, WorkSet};
use crate::coordinator::spawner::{ProcessSpawner, WorkerSpawner};
use crate::coordinator::supervisor::{SupervisionOutcome, Supervisor};
use crate::coordinator::{PhaseTracker, RunPhase};
use crate::job::{SyncJob, SyncMode, INDEX_JOB_KIND};
use crate::rpc::RpcChainReader;
use crate::runtime::config::SyncConfig;
use crate::runtime::error::{find_sync_error, SyncError};
use crate::runtime::telemetry::{spawn_metrics_reporter, Telemetry};
use crate::store::{SqliteStore, SyncStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// How a run ended, when it ended without a fatal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(FinalizeReport),
    NothingToDo,
    AlreadyRunning,
    /// Result of a `count-missing` run.
    MissingCount(u64),
    Incomplete { abandoned: usize },
    Cancelled,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed(_)
            | RunOutcome::NothingToDo
            | RunOutcome::AlreadyRunning
            | RunOutcome::MissingCount(_) => 0,
            RunOutcome::Incomplete { .. } | RunOutcome::Cancelled => 1,
        }
    }
}

/// Drives one sync run: lock, prepare, plan, supervise, finalize, release.
pub struct Runner {
    config: SyncConfig,
    chain: Arc<dyn ChainReader>,
    store: Arc<dyn SyncStore>,
    spawner: Box<dyn WorkerSpawner>,
    locks: LockManager,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    phase_history: Vec<RunPhase>,
}

impl Runner {
    pub fn new(
        config: SyncConfig,
        chain: Arc<dyn ChainReader>,
        store: Arc<dyn SyncStore>,
        spawner: Box<dyn WorkerSpawner>,
    ) -> Self {
        let locks = LockManager::new(config.lock_dir());
        Self {
            config,
            chain,
            store,
            spawner,
            locks,
            telemetry: Arc::new(Telemetry::default()),
            shutdown: CancellationToken::new(),
            phase_history: Vec::new(),
        }
    }

    /// Production wiring: JSON-RPC ledger, SQLite store, and workers
    /// re-executed from the current binary.
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        let chain: Arc<dyn ChainReader> = Arc::new(RpcChainReader::from_config(&config)?);
        let store: Arc<dyn SyncStore> = Arc::new(SqliteStore::connect(config.database_url())?);
        let spawner = Box::new(ProcessSpawner::current_exe(&config)?);
        Ok(Self::new(config, chain, store, spawner))
    }

    /// Returns a clone of the root shutdown token so callers can hook in
    /// their own signal handling.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        Arc::clone(&self.telemetry)
    }

    /// Runs `mode`, cancelling it on Ctrl-C (SIGINT) or SIGTERM.
    pub async fn run_until_signal(&mut self, mode: SyncMode) -> Result<RunOutcome> {
        let shutdown = self.shutdown.clone();
        let watcher = tokio::spawn(async move {
            if let Some(received) = shutdown_signal().await {
                tracing::info!(signal = received, "shutdown signal received; cancelling sync run");
                shutdown.cancel();
            }
        });

        let result = self.run(mode).await;
        watcher.abort();
        result
    }

    /// Phases the last [`Runner::run`] went through, in order.
    pub fn phase_history(&self) -> &[RunPhase] {
        &self.phase_history
    }

    pub async fn run(&mut self, mode: SyncMode) -> Result<RunOutcome> {
        let started = Instant::now();
        let mut phase = PhaseTracker::new();

        let mut lock = match self.locks.acquire(INDEX_JOB_KIND) {
            Ok(lock) => lock,
            Err(err) if matches!(find_sync_error(&err), Some(SyncError::AlreadyRunning { .. })) => {
                tracing::info!(mode = %mode, "{err:#}; exiting");
                phase.advance(RunPhase::Done);
                self.phase_history = phase.history().to_vec();
                return Ok(RunOutcome::AlreadyRunning);
            }
            Err(err) => return Err(err),
        };
        phase.advance(RunPhase::Locked);

        let result = self.run_locked(mode, &mut phase).await;
        match &result {
            Ok(RunOutcome::Completed(report)) => {
                tracing::info!(
                    mode = %mode,
                    elapsed = %format_duration(started.elapsed()),
                    checkpoint = report.checkpoint,
                    transactions = report.counts.transactions,
                    addresses = report.counts.addresses,
                    "sync run complete"
                );
            }
            Ok(_) => {}
            Err(err) => {
                phase.advance(RunPhase::Aborting);
                tracing::error!(mode = %mode, error = %format!("{err:#}"), "sync run failed");
            }
        }
        phase.advance(RunPhase::Done);
        self.phase_history = phase.history().to_vec();

        if let Err(err) = lock.release() {
            tracing::warn!(error = %err, "failed to release sync lock");
        }
        result
    }

    /// Logs how many heights at or below the checkpoint have no records,
    /// without spawning anything.
    pub async fn count_missing(&mut self) -> Result<RunOutcome> {
        self.store
            .prepare()
            .await
            .context(SyncError::StoreUnreachable)?;
        let checkpoint = self.read_checkpoint_height().await?;
        let missing = self.missing_heights(checkpoint).await?;
        tracing::info!(
            checkpoint,
            missing = missing.len(),
            first = missing.first().copied(),
            last = missing.last().copied(),
            "missing heights counted"
        );
        Ok(RunOutcome::MissingCount(missing.len() as u64))
    }

    async fn run_locked(&mut self, mode: SyncMode, phase: &mut PhaseTracker) -> Result<RunOutcome> {
        self.store
            .prepare()
            .await
            .context(SyncError::StoreUnreachable)?;

        let finalizer = Finalizer::new(Arc::clone(&self.store), self.config.richlist_size());
        if mode == SyncMode::Reindex {
            finalizer.prepare_reindex().await?;
        }

        phase.advance(RunPhase::Planning);
        let (job, work) = self.plan_job(mode).await?;
        let plan = PartitionPlan::new(work, job.max_per_worker, job.pool_size, job.pooling);
        if plan.is_empty() {
            tracing::info!(
                mode = %mode,
                start_height = job.start_height,
                target_height = job.target_height,
                "nothing to do"
            );
            return Ok(RunOutcome::NothingToDo);
        }

        tracing::info!(
            mode = %mode,
            start_height = job.start_height,
            target_height = job.target_height,
            heights = plan.total_units(),
            partitions = plan.spans().len(),
            initial_workers = plan.initial_workers(),
            "sync planned"
        );

        phase.advance(RunPhase::Scheduling);
        let metrics_shutdown = self.shutdown.child_token();
        let reporter = spawn_metrics_reporter(
            Arc::clone(&self.telemetry),
            metrics_shutdown.clone(),
            self.config.metrics_interval(),
        );

        let shutdown = self.shutdown.clone();
        let supervisor = Supervisor::new(
            &self.config,
            mode,
            &plan,
            self.spawner.as_mut(),
            phase,
            Arc::clone(&self.telemetry),
        );
        let outcome = supervisor.run(shutdown).await;
        self.spawner.wait_stopped().await;

        metrics_shutdown.cancel();
        if let Err(err) = reporter.await {
            tracing::warn!(error = %err, "metrics reporter task failed");
        }

        match outcome? {
            SupervisionOutcome::Completed => {}
            SupervisionOutcome::Cancelled => {
                tracing::warn!("{}", SyncError::Cancelled { mode });
                return Ok(RunOutcome::Cancelled);
            }
            SupervisionOutcome::Incomplete { abandoned } => {
                tracing::error!("{}; checkpoint left unchanged", SyncError::IncompleteSync { abandoned });
                return Ok(RunOutcome::Incomplete { abandoned });
            }
        }

        phase.advance(RunPhase::Finalizing);
        let report = finalizer.finalize(&job).await?;
        Ok(RunOutcome::Completed(report))
    }

    async fn plan_job(&self, mode: SyncMode) -> Result<(SyncJob, WorkSet)> {
        let checkpoint = self.read_checkpoint_height().await?;

        let (start_height, target_height, work) = match mode {
            SyncMode::Update | SyncMode::Reindex => {
                let target = self
                    .chain
                    .current_height()
                    .await
                    .context(SyncError::ChainUnavailable)?;
                let start = if mode == SyncMode::Reindex {
                    1
                } else {
                    checkpoint.saturating_add(1)
                };
                (start, target, WorkSet::contiguous(start, target))
            }
            SyncMode::Check => {
                let missing = self.missing_heights(checkpoint).await?;
                let start = missing.first().copied().unwrap_or(1);
                (start, checkpoint, WorkSet::sparse(missing))
            }
        };

        let job = SyncJob {
            mode,
            start_height,
            target_height,
            max_per_worker: self.config.max_per_worker(),
            pool_size: self.config.pool_size(),
            pooling: self.config.pooling(),
        };
        Ok((job, work))
    }

    async fn read_checkpoint_height(&self) -> Result<u64> {
        Ok(self
            .store
            .read_checkpoint()
            .await
            .context(SyncError::StoreUnreachable)?
            .last_synced_height)
    }

    /// Heights in `1..=checkpoint` with no recorded transaction.
    async fn missing_heights(&self, checkpoint: u64) -> Result<Vec<u64>> {
        let recorded = self
            .store
            .read_distinct_recorded_heights()
            .await
            .context("failed to read recorded heights")?;
        Ok((1..=checkpoint)
            .filter(|height| !recorded.contains(height))
            .collect())
    }
}

/// Resolves with the name of the first stop signal received, or `None` when
/// no listener could be installed.
async fn shutdown_signal() -> Option<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};

        match unix_signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                return tokio::select! {
                    result = signal::ctrl_c() => match result {
                        Ok(()) => Some("SIGINT"),
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to listen for Ctrl-C");
                            terminate.recv().await.map(|()| "SIGTERM")
                        }
                    },
                    received = terminate.recv() => received.map(|()| "SIGTERM"),
                };
            }
            Err(err) => tracing::warn!(error = %err, "failed to listen for SIGTERM"),
        }
    }

    match signal::ctrl_c().await {
        Ok(()) => Some("SIGINT"),
        Err(err) => {
            tracing::warn!(error = %err, "failed to listen for Ctrl-C");
            None
        }
    }
}

/// `HH:MM:SS`; hours are not wrapped.
pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
