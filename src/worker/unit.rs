use super::backoff::{retry_with_backoff, RetryDisposition, RetryPolicy};
use super::derive::derive_records;
use super::signal::{WorkerLaunch, WorkerSignal};
use super::sink::SignalSink;
use crate::chain::{is_not_found, ChainReader};
use crate::runtime::config::SyncConfig;
use crate::runtime::error::SyncError;
use crate::runtime::progress::ProgressTracker;
use crate::store::SyncStore;
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What a finished unit reports back to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitReport {
    pub processed: u64,
    pub last_height: Option<u64>,
}

/// Processes one assignment: fetch, derive and upsert every height in order,
/// signalling progress along the way.
pub struct WorkerUnit {
    chain: Arc<dyn ChainReader>,
    store: Arc<dyn SyncStore>,
    retry: RetryPolicy,
    progress_interval: Duration,
    shutdown: CancellationToken,
}

impl WorkerUnit {
    pub fn new(chain: Arc<dyn ChainReader>, store: Arc<dyn SyncStore>, config: &SyncConfig) -> Self {
        Self {
            chain,
            store,
            retry: RetryPolicy::from_config(config),
            progress_interval: config.progress_interval(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.retry = self.retry.with_cancellation(token.clone());
        self.shutdown = token;
        self
    }

    pub async fn run(&self, launch: &WorkerLaunch, sink: &mut dyn SignalSink) -> Result<UnitReport> {
        let id = launch.id;
        let assignment = &launch.assignment;
        let (Some(range_start), Some(range_end)) =
            (assignment.first_height(), assignment.last_height())
        else {
            sink.emit(WorkerSignal::Done { id }).await?;
            return Ok(UnitReport {
                processed: 0,
                last_height: None,
            });
        };

        sink.emit(WorkerSignal::Starting {
            id,
            pid: std::process::id(),
            range_start,
            range_end,
        })
        .await?;

        tracing::info!(
            worker = id,
            partition = launch.worker_index,
            mode = %launch.mode,
            range_start,
            range_end,
            heights = assignment.len(),
            "worker started"
        );

        let mut tracker = ProgressTracker::new(self.progress_interval);
        let mut processed = 0u64;

        for height in assignment.heights() {
            if self.shutdown.is_cancelled() {
                return Err(anyhow!("worker {id} cancelled at height {height}"));
            }

            self.sync_height_with_retry(id, height)
                .await
                .with_context(|| SyncError::HeightFetchFailed { height })?;
            processed += 1;

            if let Some(confirmed) = tracker.confirm(height, Instant::now()) {
                sink.emit(WorkerSignal::Progress {
                    id,
                    height: confirmed,
                })
                .await?;
            }
        }

        if let Some(confirmed) = tracker.flush() {
            sink.emit(WorkerSignal::Progress {
                id,
                height: confirmed,
            })
            .await?;
        }

        sink.emit(WorkerSignal::Done { id }).await?;
        tracing::info!(worker = id, processed, range_end, "worker finished");

        Ok(UnitReport {
            processed,
            last_height: tracker.last_confirmed(),
        })
    }

    async fn sync_height_with_retry(&self, worker: u64, height: u64) -> Result<()> {
        retry_with_backoff(
            &self.retry,
            |_| self.sync_height(height),
            |attempt, backoff, err, will_retry| {
                if will_retry {
                    tracing::warn!(
                        worker,
                        height,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "height sync failed; retrying"
                    );
                } else {
                    tracing::error!(
                        worker,
                        height,
                        attempt,
                        error = %err,
                        "height sync failed; retries exhausted"
                    );
                }
            },
            |err| {
                if is_not_found(err) {
                    RetryDisposition::Abort
                } else {
                    RetryDisposition::Retry
                }
            },
        )
        .await
    }

    async fn sync_height(&self, height: u64) -> Result<()> {
        let block = self.chain.fetch_block(height).await?;
        let derived = derive_records(&block);

        for address in &derived.addresses {
            self.store.upsert_address(address).await?;
        }

        for tx in &derived.transactions {
            for link in &tx.links {
                self.store.upsert_address_link(link).await?;
            }
            self.store.upsert_transaction(&tx.record).await?;
        }

        tracing::debug!(
            height,
            transactions = derived.transactions.len(),
            addresses = derived.addresses.len(),
            "height committed"
        );
        Ok(())
    }
}
