use super::records::{
    rank_entries, AddressLink, AddressRecord, Checkpoint, RankingEntry, RankingKind,
    RecordCounts, TransactionRecord,
};
use super::{StoreFuture, SyncStore};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct MemoryState {
    checkpoint: Checkpoint,
    transactions: BTreeMap<String, TransactionRecord>,
    addresses: BTreeMap<String, AddressRecord>,
    links: BTreeMap<(String, String), AddressLink>,
    rankings: HashMap<RankingKind, Vec<RankingEntry>>,
    counts: RecordCounts,
}

/// Store kept entirely in memory. Cloning shares the underlying state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the checkpoint directly, bypassing the finalizer.
    pub async fn seed_checkpoint(&self, height: u64) {
        self.state.lock().await.checkpoint.last_synced_height = height;
    }

    pub async fn transactions(&self) -> Vec<TransactionRecord> {
        self.state.lock().await.transactions.values().cloned().collect()
    }

    async fn ranked(&self, kind: RankingKind, limit: usize) -> Result<Vec<RankingEntry>> {
        let state = self.state.lock().await;
        let mut totals: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
        for link in state.links.values() {
            let entry = totals.entry(link.address.as_str()).or_default();
            entry.0 = entry.0.saturating_add(link.received_sats);
            entry.1 = entry.1.saturating_add(link.sent_sats);
        }

        let entries = totals
            .into_iter()
            .map(|(address, (received, sent))| RankingEntry {
                address: address.to_owned(),
                received_sats: received,
                sent_sats: sent,
                balance_sats: received as i64 - sent as i64,
            })
            .collect();

        Ok(rank_entries(entries, kind, limit))
    }
}

impl SyncStore for MemoryStore {
    fn prepare(&self) -> StoreFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn read_checkpoint(&self) -> StoreFuture<'_, Checkpoint> {
        Box::pin(async move { Ok(self.state.lock().await.checkpoint.clone()) })
    }

    fn write_checkpoint(&self, height: u64) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.state.lock().await.checkpoint.last_synced_height = height;
            Ok(())
        })
    }

    fn record_run(&self, at: DateTime<Utc>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.state.lock().await.checkpoint.last_run_at = Some(at);
            Ok(())
        })
    }

    fn upsert_transaction<'a>(&'a self, record: &'a TransactionRecord) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.state
                .lock()
                .await
                .transactions
                .insert(record.txid.clone(), record.clone());
            Ok(())
        })
    }

    fn upsert_address<'a>(&'a self, record: &'a AddressRecord) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state
                .addresses
                .entry(record.address.clone())
                .and_modify(|existing| {
                    existing.first_seen_height =
                        existing.first_seen_height.min(record.first_seen_height);
                })
                .or_insert_with(|| record.clone());
            Ok(())
        })
    }

    fn upsert_address_link<'a>(&'a self, link: &'a AddressLink) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.state
                .lock()
                .await
                .links
                .insert((link.address.clone(), link.txid.clone()), link.clone());
            Ok(())
        })
    }

    fn delete_all_derived(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.transactions.clear();
            state.addresses.clear();
            state.links.clear();
            Ok(())
        })
    }

    fn read_distinct_recorded_heights(&self) -> StoreFuture<'_, BTreeSet<u64>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.transactions.values().map(|tx| tx.height).collect())
        })
    }

    fn top_addresses(&self, kind: RankingKind, limit: usize) -> StoreFuture<'_, Vec<RankingEntry>> {
        Box::pin(self.ranked(kind, limit))
    }

    fn update_ranking<'a>(
        &'a self,
        kind: RankingKind,
        entries: &'a [RankingEntry],
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.state
                .lock()
                .await
                .rankings
                .insert(kind, entries.to_vec());
            Ok(())
        })
    }

    fn read_ranking(&self, kind: RankingKind) -> StoreFuture<'_, Vec<RankingEntry>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.rankings.get(&kind).cloned().unwrap_or_default())
        })
    }

    fn count_transactions(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move { Ok(self.state.lock().await.transactions.len() as u64) })
    }

    fn count_addresses(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move { Ok(self.state.lock().await.addresses.len() as u64) })
    }

    fn write_counts(&self, counts: RecordCounts) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.state.lock().await.counts = counts;
            Ok(())
        })
    }

    fn read_counts(&self) -> StoreFuture<'_, RecordCounts> {
        Box::pin(async move { Ok(self.state.lock().await.counts) })
    }
}
