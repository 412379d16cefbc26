use anyhow::Result;
use shardbox::{
    allocation::{DownloadOptions, UploadOptions},
    config::SdkConfig,
    download::ByteRange,
    error::ErrorKind,
    events::{OperationKind, StatusEvent},
    test_utils::{TestNetwork, TestContext, download_bytes, random_bytes, test_config, upload_bytes},
};
use tokio_util::sync::CancellationToken;

fn large_chunks() -> SdkConfig {
    let mut config = test_config();
    config.chunk_size = 64 * 1024;
    config
}

fn owner_context(net: &TestNetwork, config: SdkConfig) -> Result<TestContext> {
    Ok(net.context_with(net.core(net.owner.clone(), config)?)?)
}

#[tokio::test]
async fn test_small_upload_round_trip() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let ctx = owner_context(&net, large_chunks())?;
    let data = random_bytes(100 * 1024);

    let result = upload_bytes(&ctx, "/small.bin", data.clone(), UploadOptions::default()).await?;
    assert!(!result.tx_hash.is_empty());
    assert_eq!(result.committed_blobbers.len(), 4);
    let transactions = net.chain.transactions();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].hash, result.tx_hash);

    let meta = ctx.stat("/small.bin").await?;
    assert_eq!(meta.num_chunks, 2);
    assert_eq!(meta.shard_roots.len(), 4);
    for node in &net.nodes {
        assert_eq!(node.count("write_chunk"), 2);
    }

    let listing = ctx.list("/").await?;
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].path, "/small.bin");
    assert_eq!(listing[0].actual_size, 102400);

    assert_eq!(download_bytes(&ctx, "/small.bin", ByteRange::full()).await?, data);

    let rerun = TestNetwork::new(2, 2);
    let rerun_ctx = owner_context(&rerun, large_chunks())?;
    upload_bytes(&rerun_ctx, "/small.bin", data, UploadOptions::default()).await?;
    assert_eq!(rerun_ctx.stat("/small.bin").await?.validation_root, meta.validation_root);
    Ok(())
}

#[tokio::test]
async fn test_download_tolerates_dead_blobber() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let ctx = net.context()?;
    let data = random_bytes(10_000);
    upload_bytes(&ctx, "/tolerant.bin", data.clone(), UploadOptions::default()).await?;

    net.node(3).kill();
    assert_eq!(download_bytes(&ctx, "/tolerant.bin", ByteRange::full()).await?, data);
    Ok(())
}

#[tokio::test]
async fn test_quorum_loss_writes_nothing() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let ctx = net.context()?;
    upload_bytes(&ctx, "/lost.bin", random_bytes(5_000), UploadOptions::default()).await?;
    ctx.stat("/lost.bin").await?;

    net.node(1).kill();
    net.node(2).kill();
    net.node(3).kill();
    let mut sink = Vec::new();
    let err = ctx
        .download("/lost.bin", &mut sink, DownloadOptions::default(), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConsensusNotReached);
    assert!(sink.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_cached_window_is_withheld_on_quorum_loss() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let ctx = net.context()?;
    let data = random_bytes(20 * 1024);
    upload_bytes(&ctx, "/partial.bin", data.clone(), UploadOptions::default()).await?;
    assert_eq!(
        download_bytes(&ctx, "/partial.bin", ByteRange::new(0, Some(4095))).await?,
        data[..4096]
    );
    assert!(!ctx.core().cache.is_empty());

    net.node(1).kill();
    net.node(2).kill();
    net.node(3).kill();
    let mut sink = Vec::new();
    let err = ctx
        .download("/partial.bin", &mut sink, DownloadOptions::default(), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConsensusNotReached);
    assert!(sink.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_held_windows_keep_their_order() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let ctx = net.context()?;
    let data = random_bytes(20 * 1024);
    upload_bytes(&ctx, "/ordered.bin", data.clone(), UploadOptions::default()).await?;
    download_bytes(&ctx, "/ordered.bin", ByteRange::new(0, Some(4095))).await?;
    download_bytes(&ctx, "/ordered.bin", ByteRange::new(4096, Some(8191))).await?;

    assert_eq!(download_bytes(&ctx, "/ordered.bin", ByteRange::full()).await?, data);
    assert_eq!(
        download_bytes(&ctx, "/ordered.bin", ByteRange::new(1000, Some(12_000))).await?,
        data[1000..=12_000]
    );
    Ok(())
}

#[tokio::test]
async fn test_corrupt_shards_below_quorum_fail() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let ctx = net.context()?;
    upload_bytes(&ctx, "/corrupt.bin", random_bytes(5_000), UploadOptions::default()).await?;
    ctx.stat("/corrupt.bin").await?;

    net.node(1).set_corrupt(true);
    net.node(2).kill();
    net.node(3).kill();
    let mut sink = Vec::new();
    let err = ctx
        .download("/corrupt.bin", &mut sink, DownloadOptions::default(), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConsensusNotReached);
    assert!(sink.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_corrupt_blobber_is_outvoted() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let ctx = net.context()?;
    let data = random_bytes(7_777);
    upload_bytes(&ctx, "/outvoted.bin", data.clone(), UploadOptions::default()).await?;

    net.node(0).set_corrupt(true);
    assert_eq!(download_bytes(&ctx, "/outvoted.bin", ByteRange::full()).await?, data);
    Ok(())
}

#[tokio::test]
async fn test_range_download() -> Result<()> {
    let net = TestNetwork::new(3, 1);
    let ctx = net.context()?;
    let data = random_bytes(20_000);
    upload_bytes(&ctx, "/range.bin", data.clone(), UploadOptions::default()).await?;

    let slice = download_bytes(&ctx, "/range.bin", ByteRange::new(1_500, Some(9_999))).await?;
    assert_eq!(slice, data[1_500..10_000]);
    let tail = download_bytes(&ctx, "/range.bin", ByteRange::new(19_000, None)).await?;
    assert_eq!(tail, data[19_000..]);
    Ok(())
}

#[tokio::test]
async fn test_aligned_download_returns_one_window() -> Result<()> {
    let net = TestNetwork::new(2, 1);
    let ctx = net.context()?;
    let data = random_bytes(20 * 1024);
    upload_bytes(&ctx, "/aligned.bin", data.clone(), UploadOptions::default()).await?;

    let mut sink = Vec::new();
    let options = DownloadOptions::builder()
        .range(ByteRange::new(1_100, None))
        .aligned(true)
        .build();
    let report = ctx
        .download("/aligned.bin", &mut sink, options, CancellationToken::new())
        .await?;
    // window of 4 blocks of 1 KiB starting at block 1
    assert_eq!(report.start, 1024);
    assert_eq!(report.end, 5 * 1024 - 1);
    assert_eq!(report.content_range(), format!("bytes 1024-5119/{}", data.len()));
    assert_eq!(sink, data[1024..5 * 1024]);
    Ok(())
}

#[tokio::test]
async fn test_empty_file_round_trip() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let ctx = net.context()?;
    upload_bytes(&ctx, "/empty", vec![], UploadOptions::default()).await?;
    let meta = ctx.stat("/empty").await?;
    assert_eq!(meta.actual_size, 0);
    assert_eq!(meta.num_chunks, 1);
    assert!(download_bytes(&ctx, "/empty", ByteRange::full()).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_upload_survives_one_failing_blobber() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let ctx = net.context()?;
    net.node(2).fail_after_writes(Some(3));
    let data = random_bytes(8 * 1024);

    let result = upload_bytes(&ctx, "/degraded.bin", data.clone(), UploadOptions::default()).await?;
    assert_eq!(result.committed_blobbers.len(), 3);
    assert!(!result.committed_blobbers.contains(&net.node(2).id().to_string()));
    assert!(net.node(2).object("/degraded.bin").is_none());
    assert_eq!(download_bytes(&ctx, "/degraded.bin", ByteRange::full()).await?, data);
    Ok(())
}

#[tokio::test]
async fn test_upload_without_write_quorum_fails() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let ctx = net.context()?;
    net.node(2).kill();
    net.node(3).kill();
    let err = upload_bytes(&ctx, "/nope.bin", random_bytes(1_000), UploadOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConsensusNotReached);
    assert!(net.chain.transactions().is_empty());
    assert!(net.node(0).object("/nope.bin").is_none());
    Ok(())
}

#[tokio::test]
async fn test_update_replaces_content() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let ctx = net.context()?;
    upload_bytes(&ctx, "/doc.txt", b"first version".to_vec(), UploadOptions::default()).await?;
    let created = ctx.stat("/doc.txt").await?.created_at;

    let err = upload_bytes(&ctx, "/doc.txt", b"again".to_vec(), UploadOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);

    let update = UploadOptions::builder().update(true).build();
    upload_bytes(&ctx, "/doc.txt", b"second version".to_vec(), update.clone()).await?;
    let meta = ctx.stat("/doc.txt").await?;
    assert_eq!(meta.created_at, created);
    assert_eq!(download_bytes(&ctx, "/doc.txt", ByteRange::full()).await?, b"second version");

    let err = upload_bytes(&ctx, "/missing.txt", b"x".to_vec(), update).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileNotFound);
    Ok(())
}

#[tokio::test]
async fn test_thumbnail_round_trip() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let ctx = net.context()?;
    let thumbnail = random_bytes(333);
    let options = UploadOptions::builder()
        .mime_type("image/png")
        .thumbnail(thumbnail.clone())
        .build();
    upload_bytes(&ctx, "/pic.png", random_bytes(4_000), options).await?;

    let meta = ctx.stat("/pic.png").await?;
    assert_eq!(meta.mime_type, "image/png");
    assert_eq!(meta.thumbnail.as_ref().map(|t| t.size), Some(333));
    net.node(0).kill();
    assert_eq!(ctx.thumbnail("/pic.png", CancellationToken::new()).await?, thumbnail);
    Ok(())
}

#[tokio::test]
async fn test_status_events_for_upload() -> Result<()> {
    let net = TestNetwork::new(2, 1);
    let ctx = net.context()?;
    let mut events = ctx.core().events.subscribe();
    upload_bytes(&ctx, "/events.bin", random_bytes(3 * 1024), UploadOptions::default()).await?;

    let mut progress = vec![];
    let mut finished = false;
    while let Ok(event) = events.try_recv() {
        match event {
            StatusEvent::Progress { op: OperationKind::Upload, completed, .. } => progress.push(completed),
            StatusEvent::Completed { op: OperationKind::Upload, path, size, .. } => {
                assert_eq!(path, "/events.bin");
                assert_eq!(size, 3 * 1024);
                finished = true;
            }
            _ => {}
        }
    }
    assert_eq!(progress, vec![1024, 2048, 3072]);
    assert!(finished);
    Ok(())
}

#[tokio::test]
async fn test_cached_blocks_skip_blobbers() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let ctx = net.context()?;
    let data = random_bytes(2_000);
    upload_bytes(&ctx, "/cached.bin", data.clone(), UploadOptions::default()).await?;

    assert_eq!(download_bytes(&ctx, "/cached.bin", ByteRange::full()).await?, data);
    let reads: usize = net.nodes.iter().map(|n| n.count("read_shard")).sum();
    assert_eq!(download_bytes(&ctx, "/cached.bin", ByteRange::full()).await?, data);
    let again: usize = net.nodes.iter().map(|n| n.count("read_shard")).sum();
    assert_eq!(reads, again);
    assert!(!ctx.core().cache.is_empty());
    Ok(())
}
