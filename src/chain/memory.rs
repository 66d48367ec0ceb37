//! Deterministic in-process ledger. Used by tests and by the worker unit when
//! exercised without a node.

use super::block::{LedgerBlock, LedgerInput, LedgerOutput, LedgerTransaction};
use super::{ChainError, ChainReader};
use anyhow::Result;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::{Amount, BlockHash, Txid};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const GENESIS_TIME: u64 = 1_231_006_505;
const BLOCK_SPACING_SECS: u64 = 600;
const DEFAULT_ADDRESS_RING: u64 = 8;

/// Synthetic chain where height `h` carries a coinbase paying 50 BTC to
/// `addr-{h % ring}` and, from height 2, a transfer out of the previous
/// block's coinbase address.
#[derive(Clone)]
pub struct MemoryChain {
    tip: u64,
    ring: u64,
    failures: Arc<Mutex<HashMap<u64, usize>>>,
    fetches: Arc<Mutex<HashMap<u64, usize>>>,
}

impl MemoryChain {
    pub fn new(tip: u64) -> Self {
        Self::with_address_ring(tip, DEFAULT_ADDRESS_RING)
    }

    pub fn with_address_ring(tip: u64, ring: u64) -> Self {
        Self {
            tip,
            ring: ring.max(1),
            failures: Arc::new(Mutex::new(HashMap::new())),
            fetches: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn tip(&self) -> u64 {
        self.tip
    }

    /// Makes the next `times` fetches of `height` fail with a transient error.
    pub async fn fail_height(&self, height: u64, times: usize) {
        self.failures.lock().await.insert(height, times);
    }

    /// Number of fetch attempts observed for `height`, failed ones included.
    pub async fn fetch_count(&self, height: u64) -> usize {
        self.fetches.lock().await.get(&height).copied().unwrap_or(0)
    }

    pub fn address_for(&self, height: u64) -> String {
        format!("addr-{}", height % self.ring)
    }

    /// Builds the block at `height` without consulting the tip.
    pub fn block_at(&self, height: u64) -> LedgerBlock {
        let mut transactions = vec![LedgerTransaction {
            txid: synthetic_txid(height, 0),
            inputs: vec![LedgerInput::coinbase()],
            outputs: vec![LedgerOutput::pay(
                self.address_for(height),
                Amount::from_int_btc(50),
            )],
        }];

        if height >= 2 {
            let payer = self.address_for(height - 1);
            transactions.push(LedgerTransaction {
                txid: synthetic_txid(height, 1),
                inputs: vec![LedgerInput::spend(payer.clone(), Amount::from_int_btc(10))],
                outputs: vec![
                    LedgerOutput::pay(self.address_for(height + 1), Amount::from_int_btc(7)),
                    LedgerOutput::pay(payer, Amount::from_int_btc(3)),
                ],
            });
        }

        LedgerBlock {
            height,
            hash: synthetic_block_hash(height),
            time: GENESIS_TIME + height * BLOCK_SPACING_SECS,
            transactions,
        }
    }

    async fn fetch(&self, height: u64) -> Result<LedgerBlock> {
        *self.fetches.lock().await.entry(height).or_insert(0) += 1;

        if height == 0 || height > self.tip() {
            return Err(ChainError::NotFound { height }.into());
        }

        let mut failures = self.failures.lock().await;
        if let Some(remaining) = failures.get_mut(&height) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ChainError::Unavailable {
                    reason: format!("injected failure at height {height}"),
                }
                .into());
            }
        }
        drop(failures);

        Ok(self.block_at(height))
    }
}

impl ChainReader for MemoryChain {
    fn current_height(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { Ok(self.tip()) })
    }

    fn fetch_block(&self, height: u64) -> BoxFuture<'_, Result<LedgerBlock>> {
        Box::pin(self.fetch(height))
    }
}

fn synthetic_block_hash(height: u64) -> BlockHash {
    let mut seed = b"block".to_vec();
    seed.extend_from_slice(&height.to_le_bytes());
    BlockHash::from_raw_hash(sha256d::Hash::hash(&seed))
}

fn synthetic_txid(height: u64, index: u32) -> Txid {
    let mut seed = b"tx".to_vec();
    seed.extend_from_slice(&height.to_le_bytes());
    seed.extend_from_slice(&index.to_le_bytes());
    Txid::from_raw_hash(sha256d::Hash::hash(&seed))
}
