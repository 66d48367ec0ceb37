use crate::job::SyncMode;
use std::fmt;

/// Failures that decide how a sync run ends. Carried inside `anyhow::Error`
/// and recovered with `downcast_ref` where the run outcome is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Another coordinator holds the lock for this job kind.
    AlreadyRunning { job_kind: String },
    /// The store could not be reached or initialised before planning.
    StoreUnreachable,
    /// A worker went silent past the stall threshold.
    WorkerStalled { worker: u64, idle_secs: u64 },
    /// A worker gave up on one height after exhausting its retries.
    HeightFetchFailed { height: u64 },
    /// One or more partitions exhausted their recovery budget.
    IncompleteSync { abandoned: usize },
    /// The ledger could not report its current height.
    ChainUnavailable,
    /// The finalizer failed at the named stage; the checkpoint was not moved
    /// unless the stage comes after it.
    FinalizeFailed { stage: &'static str },
    /// The run was interrupted before finalizing.
    Cancelled { mode: SyncMode },
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::AlreadyRunning { job_kind } => {
                write!(f, "a {job_kind} sync is already running")
            }
            SyncError::StoreUnreachable => write!(f, "store is unreachable or not initialised"),
            SyncError::WorkerStalled { worker, idle_secs } => {
                write!(f, "worker {worker} stalled after {idle_secs}s without a heartbeat")
            }
            SyncError::HeightFetchFailed { height } => {
                write!(f, "failed to sync height {height} after exhausting retries")
            }
            SyncError::IncompleteSync { abandoned } => {
                write!(f, "sync incomplete: {abandoned} partition(s) abandoned")
            }
            SyncError::ChainUnavailable => write!(f, "ledger height is unavailable"),
            SyncError::FinalizeFailed { stage } => write!(f, "finalize failed at stage {stage}"),
            SyncError::Cancelled { mode } => write!(f, "{mode} sync cancelled before finalizing"),
        }
    }
}

impl std::error::Error for SyncError {}

impl SyncError {
    /// Process exit code for a run that ended with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::AlreadyRunning { .. } => 0,
            _ => 1,
        }
    }
}

/// Finds the first [`SyncError`] attached to `err`, either as context or as
/// a cause further down the chain.
pub fn find_sync_error(err: &anyhow::Error) -> Option<&SyncError> {
    err.downcast_ref::<SyncError>()
        .or_else(|| err.chain().find_map(|cause| cause.downcast_ref::<SyncError>()))
}
