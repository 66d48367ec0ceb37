//! Read-only access to the source ledger. Workers fetch one block per height
//! through a [`ChainReader`]; the coordinator only asks for the current height.

pub mod block;
pub mod memory;

pub use block::{LedgerBlock, LedgerInput, LedgerOutput, LedgerTransaction};
pub use memory::MemoryChain;

use anyhow::Result;
use futures::future::BoxFuture;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// The requested height is above the ledger tip.
    NotFound { height: u64 },
    /// The ledger node could not be reached or answered with garbage.
    Unavailable { reason: String },
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::NotFound { height } => {
                write!(f, "block at height {height} is not available on the ledger")
            }
            ChainError::Unavailable { reason } => write!(f, "ledger unavailable: {reason}"),
        }
    }
}

impl std::error::Error for ChainError {}

/// Returns `true` when the error chain carries [`ChainError::NotFound`].
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ChainError>(),
        Some(ChainError::NotFound { .. })
    )
}

pub trait ChainReader: Send + Sync {
    fn current_height(&self) -> BoxFuture<'_, Result<u64>>;

    fn fetch_block(&self, height: u64) -> BoxFuture<'_, Result<LedgerBlock>>;
}
