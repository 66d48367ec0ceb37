//! Turns a ledger block into the records a worker upserts.

use crate::chain::{LedgerBlock, LedgerTransaction};
use crate::store::{AddressAmount, AddressLink, AddressRecord, TransactionRecord};
use std::collections::BTreeMap;

/// Records of one transaction; links are committed before the record itself
/// so a stored transaction always has its links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedTransaction {
    pub record: TransactionRecord,
    pub links: Vec<AddressLink>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedBlock {
    pub addresses: Vec<AddressRecord>,
    pub transactions: Vec<DerivedTransaction>,
}

pub fn derive_records(block: &LedgerBlock) -> DerivedBlock {
    let block_hash = block.hash.to_string();
    let mut addresses: BTreeMap<String, AddressRecord> = BTreeMap::new();

    let transactions = block
        .transactions
        .iter()
        .map(|tx| {
            let derived = derive_transaction(block, &block_hash, tx);
            for link in &derived.links {
                addresses
                    .entry(link.address.clone())
                    .or_insert_with(|| AddressRecord {
                        address: link.address.clone(),
                        first_seen_height: block.height,
                    });
            }
            derived
        })
        .collect();

    DerivedBlock {
        addresses: addresses.into_values().collect(),
        transactions,
    }
}

fn derive_transaction(
    block: &LedgerBlock,
    block_hash: &str,
    tx: &LedgerTransaction,
) -> DerivedTransaction {
    let txid = tx.txid.to_string();
    // address -> (received, sent)
    let mut legs: BTreeMap<&str, (u64, u64)> = BTreeMap::new();

    let inputs: Vec<AddressAmount> = tx
        .inputs
        .iter()
        .filter_map(|input| {
            let address = input.address.as_deref()?;
            let sats = input.value.to_sat();
            let entry = legs.entry(address).or_default();
            entry.1 = entry.1.saturating_add(sats);
            Some(AddressAmount {
                address: address.to_owned(),
                sats,
            })
        })
        .collect();

    let outputs: Vec<AddressAmount> = tx
        .outputs
        .iter()
        .filter_map(|output| {
            let address = output.address.as_deref()?;
            let sats = output.value.to_sat();
            let entry = legs.entry(address).or_default();
            entry.0 = entry.0.saturating_add(sats);
            Some(AddressAmount {
                address: address.to_owned(),
                sats,
            })
        })
        .collect();

    let links = legs
        .into_iter()
        .map(|(address, (received, sent))| AddressLink {
            address: address.to_owned(),
            txid: txid.clone(),
            height: block.height,
            received_sats: received,
            sent_sats: sent,
        })
        .collect();

    DerivedTransaction {
        record: TransactionRecord {
            txid,
            height: block.height,
            block_hash: block_hash.to_owned(),
            timestamp: block.time,
            inputs,
            outputs,
            total_sats: tx.total_output().to_sat(),
        },
        links,
    }
}
