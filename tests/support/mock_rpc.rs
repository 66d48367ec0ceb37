use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use blocksync::chain::{LedgerBlock, MemoryChain};
use hyper::service::{make_service_fn, service_fn};
use hyper::{body, Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Serves a [`MemoryChain`] through the subset of the Bitcoin Core JSON-RPC
/// API the reader uses: `getblockcount`, `getblockhash`, `getblock <hash> 3`.
#[derive(Clone)]
pub struct MockNode {
    chain: MemoryChain,
    by_hash: Arc<RwLock<HashMap<String, u64>>>,
    auth_headers: Arc<RwLock<Vec<String>>>,
    getblock_calls: Arc<AtomicUsize>,
    unanswered_from: Arc<AtomicU64>,
    unanswered_calls: Arc<AtomicUsize>,
}

impl MockNode {
    pub fn new(chain: MemoryChain) -> Self {
        Self {
            chain,
            by_hash: Arc::default(),
            auth_headers: Arc::default(),
            getblock_calls: Arc::default(),
            unanswered_from: Arc::new(AtomicU64::new(u64::MAX)),
            unanswered_calls: Arc::default(),
        }
    }

    /// `getblockhash` for `height` and above never gets a response.
    pub fn stop_answering_from(&self, height: u64) {
        self.unanswered_from.store(height, Ordering::SeqCst);
    }

    /// Requests parked so far by [`MockNode::stop_answering_from`].
    pub fn unanswered_calls(&self) -> usize {
        self.unanswered_calls.load(Ordering::SeqCst)
    }

    fn parks(&self, call: &Value) -> bool {
        let method = call.get("method").and_then(Value::as_str);
        let height = call
            .get("params")
            .and_then(Value::as_array)
            .and_then(|params| params.first())
            .and_then(Value::as_u64);
        let from = self.unanswered_from.load(Ordering::SeqCst);
        method == Some("getblockhash") && height.is_some_and(|h| h >= from)
    }

    pub fn chain(&self) -> &MemoryChain {
        &self.chain
    }

    pub fn auth_headers(&self) -> Vec<String> {
        self.auth_headers.read().expect("mock node poisoned").clone()
    }

    pub fn getblock_calls(&self) -> usize {
        self.getblock_calls.load(Ordering::SeqCst)
    }

    fn hash_for_height(&self, height: u64) -> Option<String> {
        if height == 0 || height > self.chain.tip() {
            return None;
        }
        let hash = self.chain.block_at(height).hash.to_string();
        self.by_hash
            .write()
            .expect("mock node poisoned")
            .insert(hash.clone(), height);
        Some(hash)
    }

    fn verbose_block(&self, hash: &str) -> Option<Value> {
        let height = *self.by_hash.read().expect("mock node poisoned").get(hash)?;
        Some(verbose_json(&self.chain.block_at(height)))
    }
}

fn verbose_json(block: &LedgerBlock) -> Value {
    let tx: Vec<Value> = block
        .transactions
        .iter()
        .map(|tx| {
            let vin: Vec<Value> = tx
                .inputs
                .iter()
                .map(|input| match &input.address {
                    None => json!({ "coinbase": "04ffff001d0104", "sequence": 4294967295u64 }),
                    Some(address) => json!({
                        "txid": "00".repeat(32),
                        "vout": 0,
                        "prevout": {
                            "value": input.value.to_btc(),
                            "scriptPubKey": { "address": address, "type": "witness_v0_keyhash" },
                        },
                    }),
                })
                .collect();
            let vout: Vec<Value> = tx
                .outputs
                .iter()
                .enumerate()
                .map(|(n, output)| {
                    json!({
                        "value": output.value.to_btc(),
                        "n": n,
                        "scriptPubKey": { "address": output.address, "type": "witness_v0_keyhash" },
                    })
                })
                .collect();
            json!({ "txid": tx.txid.to_string(), "vin": vin, "vout": vout })
        })
        .collect();

    json!({
        "hash": block.hash.to_string(),
        "height": block.height,
        "time": block.time,
        "confirmations": 1,
        "tx": tx,
    })
}

pub struct MockRpcServer {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockRpcServer {
    pub async fn start(node: MockNode) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock RPC listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read mock listener address")?;
        let std_listener = listener
            .into_std()
            .context("failed to convert mock listener")?;
        std_listener
            .set_nonblocking(true)
            .context("failed to set mock listener non-blocking")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let make_service = make_service_fn(move |_| {
            let node = node.clone();
            async move { Ok::<_, Infallible>(service_fn(move |req| serve_request(node.clone(), req))) }
        });

        let server = Server::from_tcp(std_listener)
            .context("failed to build mock HTTP server")?
            .serve(make_service);
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                eprintln!("mock RPC server stopped: {err}");
            }
        });

        Ok(Self {
            url: format!("http://{}", addr),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn serve_request(node: MockNode, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::POST {
        let mut response = Response::new(Body::from("Unsupported method"));
        *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
        return Ok(response);
    }

    if let Some(auth) = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    {
        node.auth_headers
            .write()
            .expect("mock node poisoned")
            .push(auth.to_string());
    }

    let bytes = match body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(err) => {
            let mut response = Response::new(Body::from(format!("failed to read body: {err}")));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return Ok(response);
        }
    };

    let payload: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => {
            let mut response = Response::new(Body::from(format!("invalid JSON payload: {err}")));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return Ok(response);
        }
    };

    if node.parks(&payload) {
        node.unanswered_calls.fetch_add(1, Ordering::SeqCst);
        futures::future::pending::<()>().await;
    }

    let response_value = if payload.is_array() {
        Value::Array(
            payload
                .as_array()
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|call| handle_call(&node, call))
                .collect(),
        )
    } else {
        handle_call(&node, payload)
    };

    let mut response = Response::new(Body::from(response_value.to_string()));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

fn handle_call(node: &MockNode, call: Value) -> Value {
    let id = call.get("id").cloned().unwrap_or(Value::Null);
    let method = call
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let params = call
        .get("params")
        .cloned()
        .unwrap_or_else(|| Value::Array(Vec::new()));
    let first_param = params.as_array().and_then(|arr| arr.first()).cloned();

    match method.as_str() {
        "getblockcount" => success(id, json!(node.chain.tip())),
        "getblockhash" => match first_param
            .as_ref()
            .and_then(Value::as_u64)
            .and_then(|h| node.hash_for_height(h))
        {
            Some(hash) => success(id, Value::String(hash)),
            None => error(id, -8, "Block height out of range"),
        },
        "getblock" => {
            node.getblock_calls.fetch_add(1, Ordering::SeqCst);
            let verbosity = params
                .as_array()
                .and_then(|arr| arr.get(1))
                .and_then(Value::as_u64);
            if verbosity != Some(3) {
                return error(id, -32602, "mock only serves verbosity 3");
            }
            match first_param
                .as_ref()
                .and_then(Value::as_str)
                .and_then(|hash| node.verbose_block(hash))
            {
                Some(block) => success(id, block),
                None => error(id, -5, "Block not found"),
            }
        }
        _ => error(id, -32601, format!("unknown method {method}")),
    }
}

fn success(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "result": result,
        "id": id,
    })
}

fn error(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "error": {
            "code": code,
            "message": message.into(),
        },
        "id": id,
    })
}
