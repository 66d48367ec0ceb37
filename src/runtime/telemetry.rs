use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Output goes to stderr: a worker's stdout carries its signal stream.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Rolling counters updated by the supervisor loop.
#[derive(Default, Debug)]
pub struct Telemetry {
    processed_heights: AtomicU64,
    workers_spawned: AtomicU64,
    stalls: AtomicU64,
    crashes: AtomicU64,
    respawns: AtomicU64,
    abandoned_partitions: AtomicU64,
    active_workers: AtomicUsize,
}

impl Telemetry {
    pub fn record_processed_heights(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.processed_heights.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_worker_spawned(&self) {
        self.workers_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_crash(&self) {
        self.crashes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_respawn(&self) {
        self.respawns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self) {
        self.abandoned_partitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_active_workers(&self, workers: usize) {
        self.active_workers.store(workers, Ordering::Relaxed);
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            processed_heights: self.processed_heights.load(Ordering::Relaxed),
            workers_spawned: self.workers_spawned.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
            crashes: self.crashes.load(Ordering::Relaxed),
            respawns: self.respawns.load(Ordering::Relaxed),
            abandoned_partitions: self.abandoned_partitions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub processed_heights: u64,
    pub workers_spawned: u64,
    pub stalls: u64,
    pub crashes: u64,
    pub respawns: u64,
    pub abandoned_partitions: u64,
}

/// Spawns a background task that periodically logs throughput, active workers, and recoveries.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!(target: "blocksync::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current_snapshot = telemetry.snapshot();
                    let processed_delta = current_snapshot
                        .processed_heights
                        .saturating_sub(last_snapshot.processed_heights);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        processed_delta as f64 / elapsed
                    };

                    tracing::info!(
                        target: "blocksync::metrics",
                        throughput = format!("{throughput:.2}"),
                        processed = current_snapshot.processed_heights,
                        active_workers = telemetry.active_workers(),
                        spawned = current_snapshot.workers_spawned,
                        stalls = current_snapshot.stalls,
                        crashes = current_snapshot.crashes,
                        respawns = current_snapshot.respawns,
                        abandoned = current_snapshot.abandoned_partitions,
                        "sync metrics snapshot"
                    );

                    last_snapshot = current_snapshot;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
