//! Post-supervision aggregation. Stages run strictly in order and the
//! checkpoint only moves once rankings and counts are persisted, so a failed
//! finalize leaves the previous checkpoint and the run can simply be repeated.

use crate::job::SyncJob;
use crate::runtime::error::SyncError;
use crate::store::{RankingKind, RecordCounts, SyncStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeReport {
    pub checkpoint: u64,
    pub counts: RecordCounts,
    pub received_entries: usize,
    pub balance_entries: usize,
    pub finished_at: DateTime<Utc>,
}

pub struct Finalizer {
    store: Arc<dyn SyncStore>,
    richlist_size: usize,
}

impl Finalizer {
    pub fn new(store: Arc<dyn SyncStore>, richlist_size: usize) -> Self {
        Self {
            store,
            richlist_size,
        }
    }

    pub async fn finalize(&self, job: &SyncJob) -> Result<FinalizeReport> {
        let mut received_entries = 0;
        let mut balance_entries = 0;
        for kind in RankingKind::ALL {
            let entries = self
                .store
                .top_addresses(kind, self.richlist_size)
                .await
                .with_context(|| SyncError::FinalizeFailed { stage: "ranking" })?;
            self.store
                .update_ranking(kind, &entries)
                .await
                .with_context(|| SyncError::FinalizeFailed { stage: "ranking" })?;
            match kind {
                RankingKind::Received => received_entries = entries.len(),
                RankingKind::Balance => balance_entries = entries.len(),
            }
            tracing::debug!(%kind, entries = entries.len(), "ranking view rebuilt");
        }

        let counts = self
            .recount()
            .await
            .with_context(|| SyncError::FinalizeFailed { stage: "counts" })?;

        let checkpoint = self
            .advance_checkpoint(job.target_height)
            .await
            .with_context(|| SyncError::FinalizeFailed {
                stage: "checkpoint",
            })?;

        let finished_at = Utc::now();
        self.store
            .record_run(finished_at)
            .await
            .with_context(|| SyncError::FinalizeFailed {
                stage: "run_timestamp",
            })?;

        tracing::info!(
            mode = %job.mode,
            checkpoint,
            transactions = counts.transactions,
            addresses = counts.addresses,
            "finalized sync run"
        );

        Ok(FinalizeReport {
            checkpoint,
            counts,
            received_entries,
            balance_entries,
            finished_at,
        })
    }

    /// Clears everything a reindex rebuilds: derived records, both ranking
    /// views, counts and the checkpoint.
    pub async fn prepare_reindex(&self) -> Result<()> {
        self.store
            .delete_all_derived()
            .await
            .context("failed to delete derived records")?;
        for kind in RankingKind::ALL {
            self.store
                .update_ranking(kind, &[])
                .await
                .with_context(|| format!("failed to reset {kind} ranking"))?;
        }
        self.store
            .write_counts(RecordCounts::default())
            .await
            .context("failed to reset record counts")?;
        self.store
            .write_checkpoint(0)
            .await
            .context("failed to reset checkpoint")?;
        tracing::info!("derived state cleared for reindex");
        Ok(())
    }

    async fn recount(&self) -> Result<RecordCounts> {
        let counts = RecordCounts {
            transactions: self.store.count_transactions().await?,
            addresses: self.store.count_addresses().await?,
        };
        self.store.write_counts(counts).await?;
        Ok(counts)
    }

    /// Writes `max(previous, target)`; the checkpoint never moves backwards.
    async fn advance_checkpoint(&self, target: u64) -> Result<u64> {
        let previous = self.store.read_checkpoint().await?.last_synced_height;
        let next = previous.max(target);
        self.store.write_checkpoint(next).await?;
        Ok(next)
    }
}
