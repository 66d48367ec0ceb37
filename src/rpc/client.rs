//! Ledger reader backed by a Bitcoin Core node. Blocks are fetched with
//! `getblockhash` followed by `getblock <hash> 3`, which embeds the spent
//! prevout of every input so addresses and amounts come back in one call.

use crate::chain::{
    ChainError, ChainReader, LedgerBlock, LedgerInput, LedgerOutput, LedgerTransaction,
};
use crate::rpc::auth::build_auth_headers;
use crate::rpc::options::RpcClientOptions;
use crate::runtime::config::SyncConfig;
use anyhow::{anyhow, Context, Result};
use bitcoin::{Amount, BlockHash, Txid};
use futures::future::BoxFuture;
use jsonrpsee::core::client::{ClientT, Error as JsonRpcError};
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::str::FromStr;
use tokio::time::timeout;

/// Bitcoin Core's `RPC_INVALID_PARAMETER`, returned for heights past the tip.
const RPC_INVALID_PARAMETER: i32 = -8;
const VERBOSITY_WITH_PREVOUT: u8 = 3;

#[derive(Debug)]
pub enum RpcError {
    Timeout { method: &'static str },
    Malformed { method: &'static str, reason: String },
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Timeout { method } => write!(f, "rpc method {method} timed out"),
            RpcError::Malformed { method, reason } => {
                write!(f, "rpc {method} returned an unusable response: {reason}")
            }
        }
    }
}

impl std::error::Error for RpcError {}

#[derive(Debug, Clone)]
pub struct RpcChainReader {
    client: HttpClient,
    options: RpcClientOptions,
}

impl RpcChainReader {
    pub fn new(
        url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        Self::with_options(url, user, password, RpcClientOptions::default())
    }

    pub fn with_options(
        url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        options: RpcClientOptions,
    ) -> Result<Self> {
        options.validate()?;

        let rpc_url = url.into();
        let headers = build_auth_headers(&user.into(), &password.into())?;
        let max_request_body_size = options.max_request_body_bytes.min(u32::MAX as usize) as u32;
        let max_response_body_size = options.max_response_body_bytes.min(u32::MAX as usize) as u32;

        let client = HttpClientBuilder::default()
            .set_headers(headers)
            .request_timeout(options.request_timeout)
            .max_concurrent_requests(options.max_concurrent_requests)
            .max_request_size(max_request_body_size)
            .max_response_size(max_response_body_size)
            .build(&rpc_url)
            .map_err(|err| anyhow!("failed to build RPC client: {err}"))?;

        Ok(Self {
            client,
            options,
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let options = RpcClientOptions {
            request_timeout: config.rpc_timeout(),
            ..RpcClientOptions::default()
        };
        Self::with_options(
            config.rpc_url().to_owned(),
            config.rpc_user().to_owned(),
            config.rpc_password().to_owned(),
            options,
        )
    }

    pub async fn get_block_count(&self) -> Result<u64> {
        let height: u64 = self.call("getblockcount", rpc_params![]).await?;
        tracing::debug!(tip = height, "refreshed ledger height");
        Ok(height)
    }

    pub async fn get_block_hash(&self, height: u64) -> Result<BlockHash> {
        let raw: String = match self.call("getblockhash", rpc_params![height]).await {
            Ok(raw) => raw,
            Err(err) if is_invalid_parameter(&err) => {
                return Err(ChainError::NotFound { height }.into())
            }
            Err(err) => return Err(err),
        };

        BlockHash::from_str(&raw)
            .with_context(|| format!("failed to parse block hash for height {height}"))
    }

    async fn get_verbose_block(&self, hash: &BlockHash) -> Result<VerboseBlock> {
        self.call(
            "getblock",
            rpc_params![hash.to_string(), VERBOSITY_WITH_PREVOUT],
        )
        .await
    }

    async fn fetch(&self, height: u64) -> Result<LedgerBlock> {
        let hash = self.get_block_hash(height).await?;
        let verbose = self.get_verbose_block(&hash).await?;
        verbose.into_ledger_block(height)
    }

    async fn call<R>(&self, method: &'static str, params: ArrayParams) -> Result<R>
    where
        R: DeserializeOwned,
    {
        timeout(
            self.options.request_timeout,
            self.client.request(method, params),
        )
        .await
        .map_err(|_| RpcError::Timeout { method })?
        .map_err(|err| anyhow::Error::new(RpcCallError { method, source: err }))
    }
}

impl ChainReader for RpcChainReader {
    fn current_height(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(self.get_block_count())
    }

    fn fetch_block(&self, height: u64) -> BoxFuture<'_, Result<LedgerBlock>> {
        Box::pin(self.fetch(height))
    }
}

/// Transport or JSON-RPC failure, kept typed so callers can inspect the code.
#[derive(Debug)]
struct RpcCallError {
    method: &'static str,
    source: JsonRpcError,
}

impl std::fmt::Display for RpcCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc {} call failed: {}", self.method, self.source)
    }
}

impl std::error::Error for RpcCallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

fn is_invalid_parameter(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<RpcCallError>(),
        Some(RpcCallError {
            source: JsonRpcError::Call(object),
            ..
        }) if object.code() == RPC_INVALID_PARAMETER
    )
}

#[derive(Debug, Deserialize)]
struct VerboseBlock {
    hash: String,
    height: u64,
    time: u64,
    #[serde(default)]
    tx: Vec<VerboseTransaction>,
}

#[derive(Debug, Deserialize)]
struct VerboseTransaction {
    txid: String,
    #[serde(default)]
    vin: Vec<VerboseInput>,
    #[serde(default)]
    vout: Vec<VerboseOutput>,
}

#[derive(Debug, Deserialize)]
struct VerboseInput {
    coinbase: Option<String>,
    prevout: Option<VerboseOutput>,
}

#[derive(Debug, Deserialize)]
struct VerboseOutput {
    value: f64,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: ScriptPubKey,
}

#[derive(Debug, Deserialize)]
struct ScriptPubKey {
    address: Option<String>,
    /// Pre-22.0 nodes report a list instead of a single address.
    addresses: Option<Vec<String>>,
}

impl ScriptPubKey {
    fn into_address(self) -> Option<String> {
        self.address
            .or_else(|| self.addresses.and_then(|list| list.into_iter().next()))
    }
}

impl VerboseOutput {
    fn into_parts(self) -> Result<(Option<String>, Amount)> {
        let value = Amount::from_btc(self.value).map_err(|err| RpcError::Malformed {
            method: "getblock",
            reason: format!("invalid amount {}: {err}", self.value),
        })?;
        Ok((self.script_pub_key.into_address(), value))
    }
}

impl VerboseBlock {
    fn into_ledger_block(self, requested_height: u64) -> Result<LedgerBlock> {
        if self.height != requested_height {
            return Err(RpcError::Malformed {
                method: "getblock",
                reason: format!(
                    "asked for height {requested_height}, node returned {}",
                    self.height
                ),
            }
            .into());
        }

        let hash = BlockHash::from_str(&self.hash)
            .with_context(|| format!("failed to parse block hash {}", self.hash))?;

        let transactions = self
            .tx
            .into_iter()
            .map(VerboseTransaction::into_ledger_transaction)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("failed to decode block at height {requested_height}"))?;

        Ok(LedgerBlock {
            height: self.height,
            hash,
            time: self.time,
            transactions,
        })
    }
}

impl VerboseTransaction {
    fn into_ledger_transaction(self) -> Result<LedgerTransaction> {
        let txid = Txid::from_str(&self.txid)
            .with_context(|| format!("failed to parse txid {}", self.txid))?;

        let inputs = self
            .vin
            .into_iter()
            .map(|input| -> Result<LedgerInput> {
                match (input.coinbase, input.prevout) {
                (Some(_), _) => Ok(LedgerInput::coinbase()),
                (None, Some(prevout)) => {
                    let (address, value) = prevout.into_parts()?;
                    Ok(LedgerInput { address, value })
                }
                (None, None) => Err(RpcError::Malformed {
                    method: "getblock",
                    reason: format!("input of {txid} carries no prevout"),
                }
                .into()),
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let outputs = self
            .vout
            .into_iter()
            .map(|output| -> Result<LedgerOutput> {
                let (address, value) = output.into_parts()?;
                Ok(LedgerOutput { address, value })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(LedgerTransaction {
            txid,
            inputs,
            outputs,
        })
    }
}
