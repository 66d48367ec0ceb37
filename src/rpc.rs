//! JSON-RPC access to a Bitcoin-Core-compatible node: authentication, client
//! options, and the [`RpcChainReader`] used by worker processes.

pub mod auth;
pub mod client;
pub mod options;

pub use client::{RpcChainReader, RpcError};
pub use options::RpcClientOptions;
