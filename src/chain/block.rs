use bitcoin::{Amount, BlockHash, Txid};

/// One block as the indexer needs it: hash, timestamp and the spend/receive
/// legs of every transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerBlock {
    pub height: u64,
    pub hash: BlockHash,
    pub time: u64,
    pub transactions: Vec<LedgerTransaction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTransaction {
    pub txid: Txid,
    pub inputs: Vec<LedgerInput>,
    pub outputs: Vec<LedgerOutput>,
}

/// Spent previous output. Coinbase inputs have no address and no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerInput {
    pub address: Option<String>,
    pub value: Amount,
}

impl LedgerInput {
    pub fn coinbase() -> Self {
        Self {
            address: None,
            value: Amount::ZERO,
        }
    }

    pub fn spend(address: impl Into<String>, value: Amount) -> Self {
        Self {
            address: Some(address.into()),
            value,
        }
    }
}

/// Output leg. Non-standard scripts carry no address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerOutput {
    pub address: Option<String>,
    pub value: Amount,
}

impl LedgerOutput {
    pub fn pay(address: impl Into<String>, value: Amount) -> Self {
        Self {
            address: Some(address.into()),
            value,
        }
    }
}

impl LedgerTransaction {
    pub fn is_coinbase(&self) -> bool {
        !self.inputs.is_empty() && self.inputs.iter().all(|input| input.address.is_none())
    }

    pub fn total_output(&self) -> Amount {
        self.outputs
            .iter()
            .fold(Amount::ZERO, |acc, output| acc + output.value)
    }
}
