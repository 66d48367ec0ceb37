//! Coordinator side of a sync run: partition planning, the single-instance
//! lock, worker supervision and the once-only finalizer.

pub mod finalize;
pub mod lock;
pub mod plan;
pub mod spawner;
pub mod state;
pub mod supervisor;

use std::fmt;

/// Coarse state of a run, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Locked,
    Planning,
    Scheduling,
    Stalling,
    Recovering,
    Finalizing,
    Aborting,
    Done,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunPhase::Idle => "idle",
            RunPhase::Locked => "locked",
            RunPhase::Planning => "planning",
            RunPhase::Scheduling => "scheduling",
            RunPhase::Stalling => "stalling",
            RunPhase::Recovering => "recovering",
            RunPhase::Finalizing => "finalizing",
            RunPhase::Aborting => "aborting",
            RunPhase::Done => "done",
        };
        f.write_str(label)
    }
}

/// Current phase plus transition logging. One tracker follows a run from
/// the lock to the end, through the supervisor's stall and recovery phases.
#[derive(Debug)]
pub struct PhaseTracker {
    current: RunPhase,
    history: Vec<RunPhase>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            current: RunPhase::Idle,
            history: vec![RunPhase::Idle],
        }
    }

    pub fn current(&self) -> RunPhase {
        self.current
    }

    /// Every phase entered so far, starting with `Idle`.
    pub fn history(&self) -> &[RunPhase] {
        &self.history
    }

    pub fn advance(&mut self, next: RunPhase) {
        if self.current == next {
            return;
        }
        tracing::debug!(from = %self.current, to = %next, "run phase transition");
        self.current = next;
        self.history.push(next);
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}
