//! SQLite-backed store. The schema is created by [`SyncStore::prepare`]; all
//! record writes are `INSERT ... ON CONFLICT` upserts.

use super::records::{
    AddressAmount, AddressLink, AddressRecord, Checkpoint, RankingEntry, RankingKind,
    RecordCounts, TransactionRecord,
};
use super::{StoreFuture, SyncStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_CONNECTIONS: u32 = 4;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS checkpoint (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        last_synced_height INTEGER NOT NULL,
        last_run_at TEXT
    )",
    "INSERT INTO checkpoint (id, last_synced_height) VALUES (1, 0) ON CONFLICT (id) DO NOTHING",
    "CREATE TABLE IF NOT EXISTS transactions (
        txid TEXT PRIMARY KEY,
        height INTEGER NOT NULL,
        block_hash TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        inputs TEXT NOT NULL,
        outputs TEXT NOT NULL,
        total_sats INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS transactions_height ON transactions (height)",
    "CREATE TABLE IF NOT EXISTS addresses (
        address TEXT PRIMARY KEY,
        first_seen_height INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS address_links (
        address TEXT NOT NULL,
        txid TEXT NOT NULL,
        height INTEGER NOT NULL,
        received_sats INTEGER NOT NULL,
        sent_sats INTEGER NOT NULL,
        PRIMARY KEY (address, txid)
    )",
    "CREATE TABLE IF NOT EXISTS rankings (
        kind TEXT NOT NULL,
        position INTEGER NOT NULL,
        address TEXT NOT NULL,
        received_sats INTEGER NOT NULL,
        sent_sats INTEGER NOT NULL,
        balance_sats INTEGER NOT NULL,
        PRIMARY KEY (kind, position)
    )",
    "CREATE TABLE IF NOT EXISTS record_counts (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        transactions INTEGER NOT NULL,
        addresses INTEGER NOT NULL
    )",
    "INSERT INTO record_counts (id, transactions, addresses) VALUES (1, 0, 0)
        ON CONFLICT (id) DO NOTHING",
];

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Builds a lazily connected pool; nothing touches the database until
    /// [`SyncStore::prepare`] runs.
    pub fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with_max_connections(database_url, DEFAULT_MAX_CONNECTIONS)
    }

    pub fn connect_with_max_connections(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid database url {database_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_lazy_with(options);

        Ok(Self { pool })
    }

    async fn create_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed to create store schema")?;
        }
        tracing::debug!("store schema ready");
        Ok(())
    }

    async fn checkpoint(&self) -> Result<Checkpoint> {
        let row = sqlx::query("SELECT last_synced_height, last_run_at FROM checkpoint WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("failed to read checkpoint")?;

        let Some(row) = row else {
            return Ok(Checkpoint::default());
        };

        let last_run_at = row
            .try_get::<Option<String>, _>("last_run_at")?
            .map(|raw| {
                DateTime::parse_from_rfc3339(&raw)
                    .map(|parsed| parsed.with_timezone(&Utc))
                    .with_context(|| format!("invalid last_run_at timestamp {raw}"))
            })
            .transpose()?;

        Ok(Checkpoint {
            last_synced_height: from_i64(row.try_get("last_synced_height")?, "last_synced_height")?,
            last_run_at,
        })
    }

    async fn set_checkpoint(&self, height: u64) -> Result<()> {
        sqlx::query(
            "INSERT INTO checkpoint (id, last_synced_height) VALUES (1, ?)
             ON CONFLICT (id) DO UPDATE SET last_synced_height = excluded.last_synced_height",
        )
        .bind(to_i64(height, "last_synced_height")?)
        .execute(&self.pool)
        .await
        .context("failed to write checkpoint")?;
        Ok(())
    }

    async fn set_last_run(&self, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO checkpoint (id, last_synced_height, last_run_at) VALUES (1, 0, ?)
             ON CONFLICT (id) DO UPDATE SET last_run_at = excluded.last_run_at",
        )
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to record run timestamp")?;
        Ok(())
    }

    async fn insert_transaction(&self, record: &TransactionRecord) -> Result<()> {
        let inputs = serde_json::to_string(&record.inputs)?;
        let outputs = serde_json::to_string(&record.outputs)?;
        sqlx::query(
            "INSERT INTO transactions (txid, height, block_hash, timestamp, inputs, outputs, total_sats)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (txid) DO UPDATE SET
                height = excluded.height,
                block_hash = excluded.block_hash,
                timestamp = excluded.timestamp,
                inputs = excluded.inputs,
                outputs = excluded.outputs,
                total_sats = excluded.total_sats",
        )
        .bind(&record.txid)
        .bind(to_i64(record.height, "height")?)
        .bind(&record.block_hash)
        .bind(to_i64(record.timestamp, "timestamp")?)
        .bind(inputs)
        .bind(outputs)
        .bind(to_i64(record.total_sats, "total_sats")?)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert transaction {}", record.txid))?;
        Ok(())
    }

    async fn insert_address(&self, record: &AddressRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO addresses (address, first_seen_height) VALUES (?, ?)
             ON CONFLICT (address) DO UPDATE SET
                first_seen_height = MIN(first_seen_height, excluded.first_seen_height)",
        )
        .bind(&record.address)
        .bind(to_i64(record.first_seen_height, "first_seen_height")?)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert address {}", record.address))?;
        Ok(())
    }

    async fn insert_link(&self, link: &AddressLink) -> Result<()> {
        sqlx::query(
            "INSERT INTO address_links (address, txid, height, received_sats, sent_sats)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (address, txid) DO UPDATE SET
                height = excluded.height,
                received_sats = excluded.received_sats,
                sent_sats = excluded.sent_sats",
        )
        .bind(&link.address)
        .bind(&link.txid)
        .bind(to_i64(link.height, "height")?)
        .bind(to_i64(link.received_sats, "received_sats")?)
        .bind(to_i64(link.sent_sats, "sent_sats")?)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert link {}:{}", link.address, link.txid))?;
        Ok(())
    }

    async fn clear_derived(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.context("failed to open transaction")?;
        for table in ["address_links", "addresses", "transactions"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("failed to clear {table}"))?;
        }
        tx.commit().await.context("failed to commit derived-record purge")?;
        Ok(())
    }

    async fn recorded_heights(&self) -> Result<BTreeSet<u64>> {
        let rows = sqlx::query("SELECT DISTINCT height FROM transactions")
            .fetch_all(&self.pool)
            .await
            .context("failed to read recorded heights")?;

        rows.iter()
            .map(|row| -> Result<u64> { from_i64(row.try_get("height")?, "height") })
            .collect()
    }

    async fn ranked(&self, kind: RankingKind, limit: usize) -> Result<Vec<RankingEntry>> {
        let order = match kind {
            RankingKind::Received => "SUM(received_sats) DESC",
            RankingKind::Balance => "(SUM(received_sats) - SUM(sent_sats)) DESC",
        };
        let query = format!(
            "SELECT address, SUM(received_sats) AS received, SUM(sent_sats) AS sent
             FROM address_links
             GROUP BY address
             ORDER BY {order}, address ASC
             LIMIT ?"
        );

        let rows = sqlx::query(&query)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("failed to rank addresses by {kind}"))?;

        rows.iter()
            .map(|row| -> Result<RankingEntry> {
                let received: i64 = row.try_get("received")?;
                let sent: i64 = row.try_get("sent")?;
                Ok(RankingEntry {
                    address: row.try_get("address")?,
                    received_sats: from_i64(received, "received")?,
                    sent_sats: from_i64(sent, "sent")?,
                    balance_sats: received - sent,
                })
            })
            .collect()
    }

    async fn replace_ranking(&self, kind: RankingKind, entries: &[RankingEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("failed to open transaction")?;
        sqlx::query("DELETE FROM rankings WHERE kind = ?")
            .bind(kind.as_str())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to clear {kind} ranking"))?;

        for (position, entry) in entries.iter().enumerate() {
            sqlx::query(
                "INSERT INTO rankings (kind, position, address, received_sats, sent_sats, balance_sats)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(kind.as_str())
            .bind(position as i64)
            .bind(&entry.address)
            .bind(to_i64(entry.received_sats, "received_sats")?)
            .bind(to_i64(entry.sent_sats, "sent_sats")?)
            .bind(entry.balance_sats)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to write {kind} ranking entry"))?;
        }

        tx.commit()
            .await
            .with_context(|| format!("failed to commit {kind} ranking"))?;
        Ok(())
    }

    async fn ranking(&self, kind: RankingKind) -> Result<Vec<RankingEntry>> {
        let rows = sqlx::query(
            "SELECT address, received_sats, sent_sats, balance_sats
             FROM rankings WHERE kind = ? ORDER BY position ASC",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to read {kind} ranking"))?;

        rows.iter()
            .map(|row| -> Result<RankingEntry> {
                Ok(RankingEntry {
                    address: row.try_get("address")?,
                    received_sats: from_i64(row.try_get("received_sats")?, "received_sats")?,
                    sent_sats: from_i64(row.try_get("sent_sats")?, "sent_sats")?,
                    balance_sats: row.try_get("balance_sats")?,
                })
            })
            .collect()
    }

    async fn count(&self, table: &'static str) -> Result<u64> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS total FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("failed to count {table}"))?;
        from_i64(row.try_get("total")?, table)
    }

    async fn set_counts(&self, counts: RecordCounts) -> Result<()> {
        sqlx::query(
            "INSERT INTO record_counts (id, transactions, addresses) VALUES (1, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                transactions = excluded.transactions,
                addresses = excluded.addresses",
        )
        .bind(to_i64(counts.transactions, "transactions")?)
        .bind(to_i64(counts.addresses, "addresses")?)
        .execute(&self.pool)
        .await
        .context("failed to write record counts")?;
        Ok(())
    }

    async fn counts(&self) -> Result<RecordCounts> {
        let row = sqlx::query("SELECT transactions, addresses FROM record_counts WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("failed to read record counts")?;

        match row {
            Some(row) => Ok(RecordCounts {
                transactions: from_i64(row.try_get("transactions")?, "transactions")?,
                addresses: from_i64(row.try_get("addresses")?, "addresses")?,
            }),
            None => Ok(RecordCounts::default()),
        }
    }

    /// Reads back a transaction record; used by tests and diagnostics.
    pub async fn transaction(&self, txid: &str) -> Result<Option<TransactionRecord>> {
        let row = sqlx::query(
            "SELECT txid, height, block_hash, timestamp, inputs, outputs, total_sats
             FROM transactions WHERE txid = ?",
        )
        .bind(txid)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to read transaction {txid}"))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let inputs: String = row.try_get("inputs")?;
        let outputs: String = row.try_get("outputs")?;
        Ok(Some(TransactionRecord {
            txid: row.try_get("txid")?,
            height: from_i64(row.try_get("height")?, "height")?,
            block_hash: row.try_get("block_hash")?,
            timestamp: from_i64(row.try_get("timestamp")?, "timestamp")?,
            inputs: serde_json::from_str::<Vec<AddressAmount>>(&inputs)?,
            outputs: serde_json::from_str::<Vec<AddressAmount>>(&outputs)?,
            total_sats: from_i64(row.try_get("total_sats")?, "total_sats")?,
        }))
    }
}

impl SyncStore for SqliteStore {
    fn prepare(&self) -> StoreFuture<'_, ()> {
        Box::pin(self.create_schema())
    }

    fn read_checkpoint(&self) -> StoreFuture<'_, Checkpoint> {
        Box::pin(self.checkpoint())
    }

    fn write_checkpoint(&self, height: u64) -> StoreFuture<'_, ()> {
        Box::pin(self.set_checkpoint(height))
    }

    fn record_run(&self, at: DateTime<Utc>) -> StoreFuture<'_, ()> {
        Box::pin(self.set_last_run(at))
    }

    fn upsert_transaction<'a>(&'a self, record: &'a TransactionRecord) -> StoreFuture<'a, ()> {
        Box::pin(self.insert_transaction(record))
    }

    fn upsert_address<'a>(&'a self, record: &'a AddressRecord) -> StoreFuture<'a, ()> {
        Box::pin(self.insert_address(record))
    }

    fn upsert_address_link<'a>(&'a self, link: &'a AddressLink) -> StoreFuture<'a, ()> {
        Box::pin(self.insert_link(link))
    }

    fn delete_all_derived(&self) -> StoreFuture<'_, ()> {
        Box::pin(self.clear_derived())
    }

    fn read_distinct_recorded_heights(&self) -> StoreFuture<'_, BTreeSet<u64>> {
        Box::pin(self.recorded_heights())
    }

    fn top_addresses(&self, kind: RankingKind, limit: usize) -> StoreFuture<'_, Vec<RankingEntry>> {
        Box::pin(self.ranked(kind, limit))
    }

    fn update_ranking<'a>(
        &'a self,
        kind: RankingKind,
        entries: &'a [RankingEntry],
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.replace_ranking(kind, entries))
    }

    fn read_ranking(&self, kind: RankingKind) -> StoreFuture<'_, Vec<RankingEntry>> {
        Box::pin(self.ranking(kind))
    }

    fn count_transactions(&self) -> StoreFuture<'_, u64> {
        Box::pin(self.count("transactions"))
    }

    fn count_addresses(&self) -> StoreFuture<'_, u64> {
        Box::pin(self.count("addresses"))
    }

    fn write_counts(&self, counts: RecordCounts) -> StoreFuture<'_, ()> {
        Box::pin(self.set_counts(counts))
    }

    fn read_counts(&self) -> StoreFuture<'_, RecordCounts> {
        Box::pin(self.counts())
    }
}

fn to_i64(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("{field} value {value} does not fit in i64"))
}

fn from_i64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("{field} value {value} is negative"))
}
