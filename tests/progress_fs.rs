use std::{path::Path, sync::Arc};

use anyhow::Result;
use shardbox::{
    allocation::{DownloadOptions, UploadOptions},
    context::CoreContext,
    error::ErrorKind,
    fs::{ChannelFs, DiskFs, FileSystem, MemFs},
    progress::{Encoding, ProgressStore, UploadProgress, progress_id},
    test_utils::{TestNetwork, random_bytes, test_config},
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn sample_progress() -> UploadProgress {
    let mut progress = UploadProgress::new("alloc", "/a/b.bin", "fingerprint", 1024, 10_000, 4);
    progress.uploaded_chunks = 3;
    progress.blobber_offsets = vec![3, 3, 2, 3];
    progress.connection_ids = vec!["c0".into(), "c1".into(), String::new(), "c3".into()];
    progress.failed_blobbers = vec![2];
    progress
}

#[tokio::test]
async fn test_disk_progress_round_trip() -> Result<()> {
    let dir = TempDir::new()?;
    let fs: Arc<dyn FileSystem> = Arc::new(DiskFs::new(dir.path().join("progress"))?);
    let progress = sample_progress();

    for encoding in [Encoding::Json, Encoding::Cbor] {
        let store = ProgressStore::new(fs.clone()).with_encoding(encoding);
        assert!(store.is_durable());
        store.save(&progress).await?;
        assert_eq!(store.load(&progress.progress_id).await?, Some(progress.clone()));
        store.remove(&progress.progress_id).await?;
        assert_eq!(store.load(&progress.progress_id).await?, None);
        store.remove(&progress.progress_id).await?;
    }

    let err = fs.save_progress("../escape", b"{}").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    Ok(())
}

#[tokio::test]
async fn test_progress_tolerates_newer_records() -> Result<()> {
    let fs = MemFs::new();
    let progress = sample_progress();
    let mut record = serde_json::to_value(&progress)?;
    record["future_field"] = serde_json::json!({"nested": true});
    if let Some(map) = record.as_object_mut() {
        map.remove("version");
    }
    fs.save_progress(&progress.progress_id, &serde_json::to_vec(&record)?)?;

    let store = ProgressStore::new(Arc::new(fs));
    assert!(!store.is_durable());
    let loaded = store.load(&progress.progress_id).await?;
    assert_eq!(loaded, Some(progress));
    Ok(())
}

#[tokio::test]
async fn test_progress_lock_is_exclusive() -> Result<()> {
    let store = ProgressStore::new(Arc::new(MemFs::new()));
    let id = progress_id("alloc", "/x", "hash");
    assert_eq!(id.len(), 64);
    assert_ne!(id, progress_id("alloc", "/y", "hash"));

    let guard = store.lock(&id).await?;
    assert!(store.try_lock(&id)?.is_none());
    assert!(store.try_lock(&progress_id("alloc", "/y", "hash"))?.is_some());
    drop(guard);
    assert!(store.try_lock(&id)?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_released_progress_ids_leave_the_lock_table() -> Result<()> {
    let store = ProgressStore::new(Arc::new(MemFs::new()));
    for i in 0..32 {
        let guard = store.lock(&progress_id("alloc", &format!("/f{}", i), "hash")).await?;
        assert_eq!(store.lock_count(), 1);
        drop(guard);
    }
    assert_eq!(store.lock_count(), 0);

    let id = progress_id("alloc", "/shared", "hash");
    let first = store.lock(&id).await?;
    let waiter = tokio::spawn({
        let store = store.clone();
        let id = id.clone();
        async move { store.lock(&id).await.map(drop) }
    });
    tokio::task::yield_now().await;
    drop(first);
    waiter.await??;
    assert_eq!(store.lock_count(), 0);

    assert!(store.try_lock(&id)?.is_some());
    assert_eq!(store.lock_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_disk_file_transfer() -> Result<()> {
    let dir = TempDir::new()?;
    let net = TestNetwork::new(2, 2);
    let fs = Arc::new(DiskFs::new(dir.path().join("progress"))?);
    let ctx = net.context_with(CoreContext::new(Some(net.owner.clone()), fs, test_config())?)?;

    let data = random_bytes(12_345);
    let source = dir.path().join("source.bin");
    std::fs::write(&source, &data)?;
    ctx.upload_file(&source, "/disk.bin", UploadOptions::default(), CancellationToken::new())
        .await?;
    assert_eq!(std::fs::read_dir(dir.path().join("progress"))?.count(), 0);

    let target = dir.path().join("out/copy.bin");
    let report = ctx
        .download_to_file("/disk.bin", &target, DownloadOptions::default(), CancellationToken::new())
        .await?;
    assert_eq!(report.bytes_written, data.len() as u64);
    assert_eq!(std::fs::read(&target)?, data);
    Ok(())
}

#[tokio::test]
async fn test_memory_file_transfer() -> Result<()> {
    let net = TestNetwork::new(2, 1);
    let ctx = net.context()?;
    let data = random_bytes(4_000);
    net.fs.insert("/local/in.bin", data.clone())?;

    ctx.upload_file(Path::new("/local/in.bin"), "/mem.bin", UploadOptions::default(), CancellationToken::new())
        .await?;
    ctx.download_to_file("/mem.bin", Path::new("/local/out.bin"), DownloadOptions::default(), CancellationToken::new())
        .await?;
    assert_eq!(net.fs.read(Path::new("/local/out.bin"))?, data);

    let err = ctx
        .upload_file(Path::new("/local/missing.bin"), "/x.bin", UploadOptions::default(), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileNotFound);
    Ok(())
}

#[tokio::test]
async fn test_channel_file_streams_download() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let uploader = net.context()?;
    let data = random_bytes(9_999);
    shardbox::test_utils::upload_bytes(&uploader, "/streamed.bin", data.clone(), UploadOptions::default())
        .await?;

    let fs = ChannelFs::new();
    let mut rx = fs.stream("/sink")?;
    let core = CoreContext::new(Some(net.owner.clone()), Arc::new(fs.clone()), test_config())?;
    let ctx = net.context_with(core)?;
    ctx.download_to_file("/streamed.bin", Path::new("/sink"), DownloadOptions::default(), CancellationToken::new())
        .await?;

    let mut received = vec![];
    while let Ok(part) = rx.try_recv() {
        received.extend(part);
    }
    assert_eq!(received, data);

    let err = fs
        .open(Path::new("/sink"), shardbox::fs::OpenMode::Create)
        .err()
        .map(|e| e.kind());
    assert_eq!(err, Some(ErrorKind::FileNotFound));
    Ok(())
}
