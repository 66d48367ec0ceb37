//! Newline-delimited JSON messages exchanged across the process boundary.

use crate::job::{Assignment, SyncMode};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub type WorkerId = u64;

/// Lifecycle and progress messages a worker writes to its stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum WorkerSignal {
    Starting {
        id: WorkerId,
        pid: u32,
        range_start: u64,
        range_end: u64,
    },
    /// `height` is the highest height whose records are fully committed.
    Progress { id: WorkerId, height: u64 },
    Done { id: WorkerId },
}

impl WorkerSignal {
    pub fn worker_id(&self) -> WorkerId {
        match self {
            WorkerSignal::Starting { id, .. }
            | WorkerSignal::Progress { id, .. }
            | WorkerSignal::Done { id } => *id,
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to encode worker signal")
    }

    pub fn decode(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim())
            .with_context(|| format!("malformed worker signal: {}", line.trim()))
    }
}

/// Parameters written to a worker's stdin as its first and only line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLaunch {
    pub id: WorkerId,
    /// Index of the partition this worker (or its predecessor) was planned for.
    pub worker_index: usize,
    pub mode: SyncMode,
    pub assignment: Assignment,
}

impl WorkerLaunch {
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to encode worker launch")
    }

    pub fn decode(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim()).context("malformed worker launch parameters")
    }
}
