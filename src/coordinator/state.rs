//! Bookkeeping owned by the supervisor: queued partitions, live workers, and
//! the completion flag.

use super::spawner::WorkerProcess;
use crate::job::Assignment;
use crate::worker::WorkerId;
use std::collections::{BTreeMap, VecDeque};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Spawned, no `starting` signal seen yet.
    Starting,
    Running,
    Done,
    Stalled,
}

pub struct WorkerRecord {
    pub id: WorkerId,
    pub partition: usize,
    /// 0 for the first launch of a partition, incremented per recovery.
    pub attempt: u32,
    pub assignment: Assignment,
    pub last_reported_height: Option<u64>,
    pub last_heartbeat: Instant,
    pub status: WorkerStatus,
    pub pid: Option<u32>,
    pub process: Box<dyn WorkerProcess>,
}

impl WorkerRecord {
    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }
}

impl std::fmt::Debug for WorkerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRecord")
            .field("id", &self.id)
            .field("partition", &self.partition)
            .field("attempt", &self.attempt)
            .field("assignment", &self.assignment)
            .field("last_reported_height", &self.last_reported_height)
            .field("status", &self.status)
            .field("pid", &self.pid)
            .finish()
    }
}

/// A partition waiting for a free pool slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedWork {
    pub partition: usize,
    pub attempt: u32,
    pub assignment: Assignment,
}

#[derive(Debug, Default)]
pub struct SchedulerState {
    pub pending: VecDeque<QueuedWork>,
    pub workers: BTreeMap<WorkerId, WorkerRecord>,
    next_id: WorkerId,
    completed_partitions: usize,
    abandoned: Vec<usize>,
    completion_taken: bool,
}

impl SchedulerState {
    pub fn new(assignments: Vec<Assignment>) -> Self {
        let pending = assignments
            .into_iter()
            .enumerate()
            .map(|(partition, assignment)| QueuedWork {
                partition,
                attempt: 0,
                assignment,
            })
            .collect();
        Self {
            pending,
            next_id: 1,
            ..Self::default()
        }
    }

    pub fn allocate_id(&mut self) -> WorkerId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn mark_completed(&mut self) {
        self.completed_partitions += 1;
    }

    pub fn mark_abandoned(&mut self, partition: usize) {
        self.abandoned.push(partition);
    }

    pub fn completed_partitions(&self) -> usize {
        self.completed_partitions
    }

    pub fn abandoned(&self) -> &[usize] {
        &self.abandoned
    }

    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    /// Nothing queued and nothing running.
    pub fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.workers.is_empty()
    }

    /// Returns `true` exactly once: the first time it is called on a drained
    /// state.
    pub fn take_completion(&mut self) -> bool {
        if self.completion_taken || !self.is_drained() {
            return false;
        }
        self.completion_taken = true;
        true
    }
}
