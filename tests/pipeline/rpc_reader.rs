use std::sync::Arc;

use crate::support::helpers::{expected_transactions, init_tracing, test_config};
use crate::support::mock_rpc::{MockNode, MockRpcServer};
use anyhow::Result;
use base64::Engine;
use blocksync::chain::{is_not_found, ChainReader, MemoryChain};
use blocksync::job::{Assignment, SyncMode};
use blocksync::store::{SqliteStore, SyncStore};
use blocksync::worker::{ChannelSink, WorkerLaunch, WorkerSignal, WorkerUnit};
use blocksync::RpcChainReader;
use tempfile::tempdir;
use tokio::sync::mpsc;

#[tokio::test]
async fn reader_decodes_verbose_blocks_from_node() -> Result<()> {
    init_tracing();
    let node = MockNode::new(MemoryChain::new(20));
    let server = MockRpcServer::start(node.clone()).await?;
    let reader = RpcChainReader::new(server.url(), "alice", "secret")?;

    assert_eq!(reader.current_height().await?, 20);
    for height in [1, 2, 20] {
        assert_eq!(reader.fetch_block(height).await?, node.chain().block_at(height));
    }

    let expected = format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode("alice:secret")
    );
    assert!(node.auth_headers().iter().all(|h| h == &expected));
    assert!(!node.auth_headers().is_empty());

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn heights_past_tip_are_not_found() -> Result<()> {
    init_tracing();
    let node = MockNode::new(MemoryChain::new(5));
    let server = MockRpcServer::start(node.clone()).await?;
    let reader = RpcChainReader::new(server.url(), "user", "pass")?;

    let err = reader.fetch_block(6).await.unwrap_err();
    assert!(is_not_found(&err), "unexpected error: {err:#}");
    assert_eq!(node.getblock_calls(), 0);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn worker_unit_commits_rpc_blocks_into_sqlite() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let db_url = format!("sqlite://{}", dir.path().join("index.db").display());
    let node = MockNode::new(MemoryChain::new(30));
    let server = MockRpcServer::start(node).await?;

    let config = test_config(dir.path())
        .rpc_url(server.url())
        .database_url(db_url.clone())
        .build()?;
    let chain: Arc<dyn ChainReader> = Arc::new(RpcChainReader::from_config(&config)?);
    let store = SqliteStore::connect(&db_url)?;
    store.prepare().await?;

    let unit = WorkerUnit::new(chain, Arc::new(store.clone()), &config);
    let (tx, mut rx) = mpsc::channel(256);
    let mut sink = ChannelSink::new(tx);
    let launch = WorkerLaunch {
        id: 9,
        worker_index: 0,
        mode: SyncMode::Update,
        assignment: Assignment::Range { start: 1, end: 10 },
    };
    let report = unit.run(&launch, &mut sink).await?;
    drop(sink);

    assert_eq!(report.processed, 10);
    assert_eq!(report.last_height, Some(10));

    let mut signals = Vec::new();
    while let Some(signal) = rx.recv().await {
        signals.push(signal);
    }
    assert!(matches!(signals.first(), Some(WorkerSignal::Starting { id: 9, .. })));
    assert_eq!(signals.last(), Some(&WorkerSignal::Done { id: 9 }));
    assert!(signals.contains(&WorkerSignal::Progress { id: 9, height: 10 }));

    assert_eq!(store.count_transactions().await?, expected_transactions(1, 10));
    let heights = store.read_distinct_recorded_heights().await?;
    assert_eq!(heights.into_iter().collect::<Vec<_>>(), (1..=10).collect::<Vec<_>>());

    // Reprocessing is idempotent.
    let (tx, mut rx) = mpsc::channel(256);
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
    unit.run(&launch, &mut ChannelSink::new(tx)).await?;
    drain.await?;
    assert_eq!(store.count_transactions().await?, expected_transactions(1, 10));

    server.shutdown().await;
    Ok(())
}
