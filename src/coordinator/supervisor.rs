//! The supervisor loop: keeps the pool full, watches heartbeats, and turns
//! stalled or crashed workers into continuations of their partition.

use super::plan::PartitionPlan;
use super::spawner::WorkerSpawner;
use super::state::{QueuedWork, SchedulerState, WorkerRecord, WorkerStatus};
use super::{PhaseTracker, RunPhase};
use crate::job::SyncMode;
use crate::runtime::config::SyncConfig;
use crate::runtime::error::SyncError;
use crate::runtime::telemetry::Telemetry;
use crate::worker::{WorkerId, WorkerLaunch, WorkerSignal};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio::select;
use tokio_util::sync::CancellationToken;

pub use super::spawner::SupervisorEvent;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How supervision ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisionOutcome {
    /// Every partition finished.
    Completed,
    /// All work stopped, but `abandoned` partitions ran out of recoveries.
    Incomplete { abandoned: usize },
    Cancelled,
}

pub struct Supervisor<'a> {
    mode: SyncMode,
    pool_limit: usize,
    stall_threshold: Duration,
    tick: Duration,
    max_recoveries: u32,
    spawner: &'a mut dyn WorkerSpawner,
    telemetry: Arc<Telemetry>,
    state: SchedulerState,
    phase: &'a mut PhaseTracker,
    events_tx: mpsc::Sender<SupervisorEvent>,
    events_rx: mpsc::Receiver<SupervisorEvent>,
}

impl<'a> Supervisor<'a> {
    pub fn new(
        config: &SyncConfig,
        mode: SyncMode,
        plan: &PartitionPlan,
        spawner: &'a mut dyn WorkerSpawner,
        phase: &'a mut PhaseTracker,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            mode,
            pool_limit: plan.pool_limit().max(1),
            stall_threshold: config.stall_threshold(),
            tick: config.supervisor_tick(),
            max_recoveries: config.max_recoveries(),
            spawner,
            telemetry,
            state: SchedulerState::new(plan.assignments()),
            phase,
            events_tx,
            events_rx,
        }
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn phase(&self) -> RunPhase {
        self.phase.current()
    }

    /// Spawns the initial workers, then drives events and ticks until the
    /// plan drains or `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<SupervisionOutcome> {
        self.start(Instant::now())?;

        let mut ticker = time::interval_at(Instant::now() + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if let Some(outcome) = self.poll_completion() {
                return Ok(outcome);
            }

            select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.phase.advance(RunPhase::Aborting);
                    tracing::warn!(
                        active = self.state.active_workers(),
                        queued = self.state.pending.len(),
                        "shutdown requested; killing workers"
                    );
                    self.kill_all();
                    return Ok(SupervisionOutcome::Cancelled);
                }
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event, Instant::now())?;
                }
                _ = ticker.tick() => {
                    self.on_tick(Instant::now())?;
                }
            }
        }
    }

    pub fn start(&mut self, now: Instant) -> Result<()> {
        self.phase.advance(RunPhase::Scheduling);
        tracing::info!(
            partitions = self.state.pending.len(),
            pool = self.pool_limit,
            mode = %self.mode,
            "supervision started"
        );
        self.fill_pool(now)
    }

    /// The outcome, the first time the plan is found drained.
    pub fn poll_completion(&mut self) -> Option<SupervisionOutcome> {
        if !self.state.take_completion() {
            return None;
        }
        let abandoned = self.state.abandoned().len();
        tracing::info!(
            completed = self.state.completed_partitions(),
            abandoned,
            "all partitions settled"
        );
        Some(if abandoned == 0 {
            SupervisionOutcome::Completed
        } else {
            SupervisionOutcome::Incomplete { abandoned }
        })
    }

    pub fn handle_event(&mut self, event: SupervisorEvent, now: Instant) -> Result<()> {
        match event {
            SupervisorEvent::Signal(WorkerSignal::Starting {
                id,
                pid,
                range_start,
                range_end,
            }) => {
                let Some(record) = self.state.workers.get_mut(&id) else {
                    tracing::debug!(worker = id, "ignoring starting signal from unknown worker");
                    return Ok(());
                };
                record.status = WorkerStatus::Running;
                record.pid = Some(pid);
                record.last_heartbeat = now;
                tracing::debug!(worker = id, pid, range_start, range_end, "worker running");
            }
            SupervisorEvent::Signal(WorkerSignal::Progress { id, height }) => {
                let Some(record) = self.state.workers.get_mut(&id) else {
                    tracing::debug!(worker = id, height, "ignoring progress from unknown worker");
                    return Ok(());
                };
                let advanced = record
                    .assignment
                    .units_between(record.last_reported_height, height);
                self.telemetry.record_processed_heights(advanced);
                record.last_reported_height = record.last_reported_height.max(Some(height));
                record.last_heartbeat = now;
                if record.status == WorkerStatus::Starting {
                    record.status = WorkerStatus::Running;
                }
            }
            SupervisorEvent::Signal(WorkerSignal::Done { id }) => {
                let Some(mut record) = self.state.workers.remove(&id) else {
                    tracing::debug!(worker = id, "ignoring done from unknown worker");
                    return Ok(());
                };
                record.status = WorkerStatus::Done;
                record.process.kill();
                self.state.mark_completed();
                tracing::info!(
                    worker = id,
                    partition = record.partition,
                    assignment = %record.assignment,
                    "worker done"
                );
                self.fill_pool(now)?;
            }
            SupervisorEvent::Exited { id, success } => {
                if !self.state.workers.contains_key(&id) {
                    return Ok(());
                }
                self.telemetry.record_crash();
                tracing::warn!(worker = id, success, "worker exited without reporting done");
                self.recover(id, now)?;
                self.phase.advance(RunPhase::Scheduling);
            }
        }
        Ok(())
    }

    /// Stall sweep over workers that are still expected to report.
    pub fn on_tick(&mut self, now: Instant) -> Result<()> {
        let stalled: Vec<(WorkerId, Duration)> = self
            .state
            .workers
            .values()
            .filter(|record| {
                matches!(record.status, WorkerStatus::Starting | WorkerStatus::Running)
            })
            .map(|record| (record.id, record.idle_for(now)))
            .filter(|(_, idle)| *idle > self.stall_threshold)
            .collect();

        if stalled.is_empty() {
            return Ok(());
        }

        self.phase.advance(RunPhase::Stalling);
        for (id, idle) in stalled {
            if let Some(record) = self.state.workers.get_mut(&id) {
                record.status = WorkerStatus::Stalled;
            }
            self.telemetry.record_stall();
            let stall = SyncError::WorkerStalled {
                worker: id,
                idle_secs: idle.as_secs(),
            };
            tracing::warn!(worker = id, idle_secs = idle.as_secs(), "{stall}");
            self.recover(id, now)?;
        }
        self.phase.advance(RunPhase::Scheduling);
        Ok(())
    }

    /// Kills the worker and requeues whatever it had not confirmed, at the
    /// front of the queue, unless its lineage is out of recoveries.
    fn recover(&mut self, id: WorkerId, now: Instant) -> Result<()> {
        let Some(mut record) = self.state.workers.remove(&id) else {
            return Ok(());
        };
        self.phase.advance(RunPhase::Recovering);
        record.process.kill();

        match record.assignment.continuation_after(record.last_reported_height) {
            None => {
                tracing::info!(
                    worker = id,
                    partition = record.partition,
                    "lost worker had confirmed its whole assignment"
                );
                self.state.mark_completed();
            }
            Some(remaining) if record.attempt >= self.max_recoveries => {
                tracing::error!(
                    worker = id,
                    partition = record.partition,
                    attempts = record.attempt + 1,
                    remaining = %remaining,
                    "partition abandoned after exhausting recoveries"
                );
                self.state.mark_abandoned(record.partition);
                self.telemetry.record_abandoned();
            }
            Some(remaining) => {
                tracing::info!(
                    worker = id,
                    partition = record.partition,
                    attempt = record.attempt + 1,
                    resume_from = remaining.first_height(),
                    remaining = %remaining,
                    "requeueing continuation"
                );
                self.state.pending.push_front(QueuedWork {
                    partition: record.partition,
                    attempt: record.attempt + 1,
                    assignment: remaining,
                });
                self.telemetry.record_respawn();
            }
        }

        self.fill_pool(now)
    }

    fn fill_pool(&mut self, now: Instant) -> Result<()> {
        while self.state.workers.len() < self.pool_limit {
            let Some(work) = self.state.pending.pop_front() else {
                break;
            };
            self.spawn_worker(work, now)?;
        }
        self.telemetry
            .record_active_workers(self.state.active_workers());
        Ok(())
    }

    fn spawn_worker(&mut self, work: QueuedWork, now: Instant) -> Result<()> {
        let id = self.state.allocate_id();
        let launch = WorkerLaunch {
            id,
            worker_index: work.partition,
            mode: self.mode,
            assignment: work.assignment.clone(),
        };
        let process = self
            .spawner
            .spawn(launch, self.events_tx.clone())
            .with_context(|| format!("failed to start worker for partition {}", work.partition))?;

        tracing::info!(
            worker = id,
            partition = work.partition,
            attempt = work.attempt,
            assignment = %work.assignment,
            "worker spawned"
        );
        self.telemetry.record_worker_spawned();
        self.state.workers.insert(
            id,
            WorkerRecord {
                id,
                partition: work.partition,
                attempt: work.attempt,
                assignment: work.assignment,
                last_reported_height: None,
                last_heartbeat: now,
                status: WorkerStatus::Starting,
                pid: process.pid(),
                process,
            },
        );
        Ok(())
    }

    fn kill_all(&mut self) {
        for record in self.state.workers.values_mut() {
            record.process.kill();
        }
        self.state.workers.clear();
        self.state.pending.clear();
        self.telemetry.record_active_workers(0);
    }
}
