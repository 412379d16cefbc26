use std::{sync::Arc, time::Duration};

use anyhow::Result;
use shardbox::{
    allocation::UploadOptions,
    crypto::hash_hex,
    download::ByteRange,
    error::ErrorKind,
    events::StatusEvent,
    fs::MemFile,
    progress::progress_id,
    test_utils::{TestNetwork, download_bytes, random_bytes},
};
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;

const CHUNK: u64 = 1024;
const TOTAL_CHUNKS: u64 = 40;

#[tokio::test]
async fn test_resume_sends_only_remaining_chunks() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let ctx = Arc::new(net.context()?);
    let data = random_bytes((CHUNK * TOTAL_CHUNKS) as usize);
    for node in &net.nodes {
        node.set_latency(Duration::from_millis(2));
    }

    let cancel = CancellationToken::new();
    let mut events = ctx.core().events.subscribe();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let StatusEvent::Progress { completed, .. } = event {
                    if completed >= CHUNK * TOTAL_CHUNKS / 2 {
                        cancel.cancel();
                        break;
                    }
                }
            }
        })
    };
    let err = ctx
        .upload(
            Box::new(MemFile::new(data.clone())),
            data.len() as u64,
            "/big.bin",
            UploadOptions::default(),
            cancel,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    watcher.await?;

    let allocation = ctx.allocation().await;
    let id = progress_id(&allocation.id, "/big.bin", &hash_hex(&data));
    let stored = ctx
        .core()
        .progress
        .load(&id)
        .await?
        .expect("progress kept after cancel");
    let uploaded = stored.uploaded_chunks;
    assert!(uploaded >= TOTAL_CHUNKS / 2 && uploaded < TOTAL_CHUNKS);
    for column in &stored.partial_hash_state {
        assert_eq!(column.len(), uploaded);
        assert!(column.frontier.len() <= 6);
    }
    assert!(net.chain.transactions().is_empty());

    for node in &net.nodes {
        node.reset_counts();
        node.set_latency(Duration::ZERO);
    }
    ctx.upload(
        Box::new(MemFile::new(data.clone())),
        data.len() as u64,
        "/big.bin",
        UploadOptions::default(),
        CancellationToken::new(),
    )
    .await?;
    for node in &net.nodes {
        assert_eq!(node.count("write_chunk") as u64, TOTAL_CHUNKS - uploaded);
        assert_eq!(node.count("new_connection"), 1);
    }
    assert!(ctx.core().progress.load(&id).await?.is_none());
    assert_eq!(download_bytes(&ctx, "/big.bin", ByteRange::full()).await?, data);
    Ok(())
}

#[tokio::test]
async fn test_cancel_returns_promptly() -> Result<()> {
    let net = TestNetwork::new(2, 1);
    let ctx = net.context()?;
    let data = random_bytes(64 * 1024);
    for node in &net.nodes {
        node.set_latency(Duration::from_millis(200));
    }

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });
    let started = Instant::now();
    let outcome = timeout(
        ctx.core().config.rpc_timeout + Duration::from_secs(1),
        ctx.upload(
            Box::new(MemFile::new(data.clone())),
            data.len() as u64,
            "/slow.bin",
            UploadOptions::default(),
            cancel,
        ),
    )
    .await?;
    assert_eq!(outcome.unwrap_err().kind(), ErrorKind::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(2));
    Ok(())
}

#[tokio::test]
async fn test_cancelled_download_stops() -> Result<()> {
    let net = TestNetwork::new(2, 1);
    let ctx = net.context()?;
    let data = random_bytes(16 * 1024);
    shardbox::test_utils::upload_bytes(&ctx, "/stream.bin", data, UploadOptions::default()).await?;
    ctx.stat("/stream.bin").await?;
    for node in &net.nodes {
        node.set_latency(Duration::from_secs(3));
    }

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let mut sink = Vec::new();
    let started = Instant::now();
    let err = ctx
        .download("/stream.bin", &mut sink, Default::default(), cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(2));
    Ok(())
}
