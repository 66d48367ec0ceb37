use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Address and satoshi amount of one transaction leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressAmount {
    pub address: String,
    pub sats: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub txid: String,
    pub height: u64,
    pub block_hash: String,
    pub timestamp: u64,
    pub inputs: Vec<AddressAmount>,
    pub outputs: Vec<AddressAmount>,
    pub total_sats: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    pub address: String,
    pub first_seen_height: u64,
}

/// Per (address, txid) totals. Balances are always summed from links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressLink {
    pub address: String,
    pub txid: String,
    pub height: u64,
    pub received_sats: u64,
    pub sent_sats: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RankingKind {
    Received,
    Balance,
}

impl RankingKind {
    pub const ALL: [RankingKind; 2] = [RankingKind::Received, RankingKind::Balance];

    pub fn as_str(&self) -> &'static str {
        match self {
            RankingKind::Received => "received",
            RankingKind::Balance => "balance",
        }
    }
}

impl fmt::Display for RankingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankingEntry {
    pub address: String,
    pub received_sats: u64,
    pub sent_sats: u64,
    pub balance_sats: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub last_synced_height: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordCounts {
    pub transactions: u64,
    pub addresses: u64,
}

/// Orders entries for a ranking view, highest first, address as tiebreak.
pub(crate) fn rank_entries(
    mut entries: Vec<RankingEntry>,
    kind: RankingKind,
    limit: usize,
) -> Vec<RankingEntry> {
    entries.sort_by(|a, b| {
        let primary = match kind {
            RankingKind::Received => b.received_sats.cmp(&a.received_sats),
            RankingKind::Balance => b.balance_sats.cmp(&a.balance_sats),
        };
        primary.then_with(|| a.address.cmp(&b.address))
    });
    entries.truncate(limit);
    entries
}
