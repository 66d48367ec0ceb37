//! Partitioning of a work set into disjoint spans sized for the worker pool.

use crate::job::Assignment;
use std::sync::Arc;

/// Inclusive interval of indices into a [`WorkSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub first: u64,
    pub last: u64,
}

impl Span {
    /// Number of units covered; never zero.
    pub fn units(&self) -> u64 {
        self.last - self.first + 1
    }
}

/// Splits `total` units into consecutive spans.
///
/// * pooling disabled: one span covering everything;
/// * `total < cap`: one unit per span when `total < parallelism`, otherwise
///   `ceil(total / parallelism)` units per span;
/// * otherwise spans of `cap` units, the last one clipped.
pub fn partition(total: u64, cap: u64, parallelism: usize, pooling: bool) -> Vec<Span> {
    if total == 0 {
        return Vec::new();
    }

    let cap = cap.max(1);
    let parallelism = parallelism.max(1) as u64;

    let chunk = if !pooling {
        total
    } else if total < cap {
        if total < parallelism {
            1
        } else {
            total.div_ceil(parallelism)
        }
    } else {
        cap
    };

    let mut spans = Vec::with_capacity(total.div_ceil(chunk) as usize);
    let mut first = 0u64;
    while first < total {
        let last = first.saturating_add(chunk - 1).min(total - 1);
        spans.push(Span { first, last });
        first = last + 1;
    }
    spans
}

/// Heights a run must cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkSet {
    /// Inclusive height interval; empty when `start > end`.
    Contiguous { start: u64, end: u64 },
    /// Ascending, de-duplicated heights.
    Sparse { heights: Arc<[u64]> },
}

impl WorkSet {
    pub fn contiguous(start: u64, end: u64) -> Self {
        WorkSet::Contiguous { start, end }
    }

    pub fn sparse(mut heights: Vec<u64>) -> Self {
        heights.sort_unstable();
        heights.dedup();
        WorkSet::Sparse {
            heights: heights.into(),
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            WorkSet::Contiguous { start, end } if start <= end => end - start + 1,
            WorkSet::Contiguous { .. } => 0,
            WorkSet::Sparse { heights } => heights.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maps an index span onto the heights it stands for.
    pub fn assignment(&self, span: Span) -> Assignment {
        match self {
            WorkSet::Contiguous { start, .. } => Assignment::Range {
                start: start + span.first,
                end: start + span.last,
            },
            WorkSet::Sparse { heights } => Assignment::Heights {
                heights: heights[span.first as usize..=span.last as usize].to_vec(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct PartitionPlan {
    work: WorkSet,
    spans: Vec<Span>,
    parallelism: usize,
    pooling: bool,
}

impl PartitionPlan {
    pub fn new(work: WorkSet, cap: u64, parallelism: usize, pooling: bool) -> Self {
        let spans = partition(work.len(), cap, parallelism, pooling);
        Self {
            work,
            spans,
            parallelism: parallelism.max(1),
            pooling,
        }
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn work(&self) -> &WorkSet {
        &self.work
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn total_units(&self) -> u64 {
        self.work.len()
    }

    /// Most workers alive at once.
    pub fn pool_limit(&self) -> usize {
        if self.pooling {
            self.parallelism
        } else {
            1
        }
    }

    /// Workers spawned up front; the rest wait for a free slot.
    pub fn initial_workers(&self) -> usize {
        self.pool_limit().min(self.spans.len())
    }

    pub fn assignments(&self) -> Vec<Assignment> {
        self.spans
            .iter()
            .map(|span| self.work.assignment(*span))
            .collect()
    }
}
