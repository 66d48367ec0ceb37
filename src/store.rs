//! Persistence seam for derived records, aggregates and the checkpoint.
//!
//! Every write is an idempotent upsert keyed by the record's natural key so a
//! height can be reprocessed after a stall without double counting.

pub mod memory;
pub mod records;
pub mod sqlite;

pub use memory::MemoryStore;
pub use records::{
    AddressAmount, AddressLink, AddressRecord, Checkpoint, RankingEntry, RankingKind,
    RecordCounts, TransactionRecord,
};
pub use sqlite::SqliteStore;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::BTreeSet;

pub type StoreFuture<'a, T> = BoxFuture<'a, Result<T>>;

pub trait SyncStore: Send + Sync {
    /// Ensures the store is reachable and its schema exists.
    fn prepare(&self) -> StoreFuture<'_, ()>;

    fn read_checkpoint(&self) -> StoreFuture<'_, Checkpoint>;

    fn write_checkpoint(&self, height: u64) -> StoreFuture<'_, ()>;

    fn record_run(&self, at: DateTime<Utc>) -> StoreFuture<'_, ()>;

    fn upsert_transaction<'a>(&'a self, record: &'a TransactionRecord) -> StoreFuture<'a, ()>;

    fn upsert_address<'a>(&'a self, record: &'a AddressRecord) -> StoreFuture<'a, ()>;

    fn upsert_address_link<'a>(&'a self, link: &'a AddressLink) -> StoreFuture<'a, ()>;

    /// Removes every transaction, address and link record.
    fn delete_all_derived(&self) -> StoreFuture<'_, ()>;

    /// Heights with at least one recorded transaction.
    fn read_distinct_recorded_heights(&self) -> StoreFuture<'_, BTreeSet<u64>>;

    /// Top addresses by the ranking criterion, computed from current links.
    fn top_addresses(&self, kind: RankingKind, limit: usize) -> StoreFuture<'_, Vec<RankingEntry>>;

    fn update_ranking<'a>(
        &'a self,
        kind: RankingKind,
        entries: &'a [RankingEntry],
    ) -> StoreFuture<'a, ()>;

    fn read_ranking(&self, kind: RankingKind) -> StoreFuture<'_, Vec<RankingEntry>>;

    fn count_transactions(&self) -> StoreFuture<'_, u64>;

    fn count_addresses(&self) -> StoreFuture<'_, u64>;

    fn write_counts(&self, counts: RecordCounts) -> StoreFuture<'_, ()>;

    fn read_counts(&self) -> StoreFuture<'_, RecordCounts>;
}
