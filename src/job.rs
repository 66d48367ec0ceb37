//! Job-level vocabulary shared by the coordinator and the worker processes:
//! the sync mode, the job parameters captured at launch, and the unit of work
//! handed to a single worker.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lock key for the index sync. Every mode shares it so `update`, `check`
/// and `reindex` runs exclude each other.
pub const INDEX_JOB_KIND: &str = "index";

/// How a run derives its work set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Sync from the last checkpoint to the current ledger height.
    Update,
    /// Re-scan heights at or below the checkpoint that have no recorded data.
    Check,
    /// Clear all derived state and sync from height 1.
    Reindex,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SyncMode::Update => "update",
            SyncMode::Check => "check",
            SyncMode::Reindex => "reindex",
        };
        f.write_str(label)
    }
}

/// Parameters of one sync run. `target_height` is captured once, before
/// planning, and is what the finalizer commits as the new checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
    pub mode: SyncMode,
    pub start_height: u64,
    pub target_height: u64,
    pub max_per_worker: u64,
    pub pool_size: usize,
    pub pooling: bool,
}

/// Heights assigned to a single worker, walked in ascending order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Assignment {
    /// Inclusive contiguous height interval.
    Range { start: u64, end: u64 },
    /// Explicit ascending list of heights (check mode).
    Heights { heights: Vec<u64> },
}

impl Assignment {
    pub fn first_height(&self) -> Option<u64> {
        match self {
            Assignment::Range { start, end } if start <= end => Some(*start),
            Assignment::Range { .. } => None,
            Assignment::Heights { heights } => heights.first().copied(),
        }
    }

    pub fn last_height(&self) -> Option<u64> {
        match self {
            Assignment::Range { start, end } if start <= end => Some(*end),
            Assignment::Range { .. } => None,
            Assignment::Heights { heights } => heights.last().copied(),
        }
    }

    /// Number of heights covered.
    pub fn len(&self) -> u64 {
        match self {
            Assignment::Range { start, end } => {
                if start <= end {
                    end - start + 1
                } else {
                    0
                }
            }
            Assignment::Heights { heights } => heights.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn heights(&self) -> Box<dyn Iterator<Item = u64> + Send + '_> {
        match self {
            Assignment::Range { start, end } => Box::new(*start..=*end),
            Assignment::Heights { heights } => Box::new(heights.iter().copied()),
        }
    }

    /// Work left once every height up to and including `last_confirmed` is
    /// committed. `None` when nothing remains.
    pub fn continuation_after(&self, last_confirmed: Option<u64>) -> Option<Assignment> {
        let Some(confirmed) = last_confirmed else {
            return (!self.is_empty()).then(|| self.clone());
        };

        match self {
            Assignment::Range { start, end } => {
                if confirmed >= *end {
                    return None;
                }
                let resume = confirmed.saturating_add(1).max(*start);
                Some(Assignment::Range {
                    start: resume,
                    end: *end,
                })
            }
            Assignment::Heights { heights } => {
                let remaining: Vec<u64> = heights
                    .iter()
                    .copied()
                    .filter(|height| *height > confirmed)
                    .collect();
                (!remaining.is_empty()).then_some(Assignment::Heights { heights: remaining })
            }
        }
    }

    /// Heights in `(after, upto]` that belong to this assignment.
    pub fn units_between(&self, after: Option<u64>, upto: u64) -> u64 {
        match self {
            Assignment::Range { start, end } => {
                let low = after.map(|h| h.saturating_add(1)).unwrap_or(0).max(*start);
                let high = upto.min(*end);
                if low > high {
                    0
                } else {
                    high - low + 1
                }
            }
            Assignment::Heights { heights } => heights
                .iter()
                .filter(|height| after.map_or(true, |a| **height > a) && **height <= upto)
                .count() as u64,
        }
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Assignment::Range { start, end } => write!(f, "[{start}, {end}]"),
            Assignment::Heights { heights } => match (heights.first(), heights.last()) {
                (Some(first), Some(last)) => {
                    write!(f, "{} heights in [{first}, {last}]", heights.len())
                }
                _ => f.write_str("no heights"),
            },
        }
    }
}
