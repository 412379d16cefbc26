use anyhow::Result;
use shardbox::{
    allocation::{AllocationStatus, FORBID_DELETE, FORBID_RENAME, UploadOptions},
    blobber::StagedChange,
    crypto::Credentials,
    download::ByteRange,
    error::ErrorKind,
    test_utils::{TestNetwork, download_bytes, random_bytes, test_config, upload_bytes},
};
use tokio_util::sync::CancellationToken;

fn paths(list: &[shardbox::blobber::FileMeta]) -> Vec<&str> {
    list.iter().map(|m| m.path.as_str()).collect()
}

#[tokio::test]
async fn test_directory_lifecycle() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let ctx = net.context()?;
    let cancel = CancellationToken::new();
    ctx.create_dir("/photos", cancel.clone()).await?;
    ctx.create_dir("/archive", cancel.clone()).await?;
    let data = random_bytes(3_000);
    upload_bytes(&ctx, "/photos/cat.jpg", data.clone(), UploadOptions::default()).await?;

    assert_eq!(paths(&ctx.list("/").await?), vec!["/archive", "/photos"]);
    assert_eq!(paths(&ctx.list("/photos").await?), vec!["/photos/cat.jpg"]);

    ctx.rename("/photos/cat.jpg", "kitten.jpg", cancel.clone()).await?;
    assert_eq!(
        download_bytes(&ctx, "/photos/kitten.jpg", ByteRange::full()).await?,
        data
    );
    let err = ctx.stat("/photos/cat.jpg").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileNotFound);

    ctx.copy("/photos/kitten.jpg", "/archive", cancel.clone()).await?;
    assert_eq!(
        download_bytes(&ctx, "/archive/kitten.jpg", ByteRange::full()).await?,
        data
    );
    assert!(ctx.stat("/photos/kitten.jpg").await.is_ok());

    ctx.delete("/archive/kitten.jpg", cancel.clone()).await?;
    ctx.move_object("/photos", "/archive", cancel.clone()).await?;
    assert_eq!(paths(&ctx.list("/").await?), vec!["/archive"]);
    assert_eq!(
        download_bytes(&ctx, "/archive/photos/kitten.jpg", ByteRange::full()).await?,
        data
    );
    for node in &net.nodes {
        assert_eq!(
            node.paths(),
            vec!["/archive", "/archive/photos", "/archive/photos/kitten.jpg"]
        );
    }
    Ok(())
}

#[tokio::test]
async fn test_invalid_operations_are_refused_locally() -> Result<()> {
    let net = TestNetwork::new(2, 1);
    let ctx = net.context()?;
    let cancel = CancellationToken::new();
    ctx.create_dir("/a", cancel.clone()).await?;
    ctx.create_dir("/a/b", cancel.clone()).await?;
    let writes = net.node(0).count("stage");

    let err = ctx.delete("/", cancel.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPath);
    let err = ctx.move_object("/a", "/a/b", cancel.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    let err = ctx.copy("/a/b", "/a", cancel.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    let err = ctx.rename("/a", "x/y", cancel.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidName);
    let err = ctx.create_dir("relative", cancel.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPath);
    let err = ctx.do_multi_operation(vec![], cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    assert_eq!(net.node(0).count("stage"), writes);
    Ok(())
}

#[tokio::test]
async fn test_missing_and_duplicate_targets() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let ctx = net.context()?;
    let cancel = CancellationToken::new();
    let err = ctx.delete("/ghost", cancel.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileNotFound);

    ctx.create_dir("/dup", cancel.clone()).await?;
    let roots: Vec<String> = net.nodes.iter().map(|n| n.root()).collect();
    let err = ctx.create_dir("/dup", cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConsensusFailed);
    let after: Vec<String> = net.nodes.iter().map(|n| n.root()).collect();
    assert_eq!(roots, after);
    Ok(())
}

#[tokio::test]
async fn test_multi_operation_commits_once() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let ctx = net.context()?;
    upload_bytes(&ctx, "/one.txt", b"1".to_vec(), UploadOptions::default()).await?;
    upload_bytes(&ctx, "/two.txt", b"2".to_vec(), UploadOptions::default()).await?;
    let before = net.chain.transactions().len();

    let result = ctx
        .do_multi_operation(
            vec![
                StagedChange::CreateDir { path: "/box".into() },
                StagedChange::Move {
                    path: "/one.txt".into(),
                    dest_dir: "/box".into(),
                },
                StagedChange::Rename {
                    path: "/two.txt".into(),
                    new_name: "deux.txt".into(),
                },
            ],
            CancellationToken::new(),
        )
        .await?;
    assert_eq!(net.chain.transactions().len(), before + 1);
    assert_eq!(result.committed_blobbers.len(), 4);
    assert!(result.paths.contains(&"/box/one.txt".to_string()));
    assert_eq!(paths(&ctx.list("/").await?), vec!["/box", "/deux.txt"]);
    assert_eq!(download_bytes(&ctx, "/box/one.txt", ByteRange::full()).await?, b"1");

    let err = ctx
        .do_multi_operation(
            vec![
                StagedChange::CreateDir { path: "/later".into() },
                StagedChange::Delete { path: "/nothing".into() },
            ],
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileNotFound);
    assert!(net.node(0).object("/later").is_none());
    assert_eq!(net.chain.transactions().len(), before + 1);
    Ok(())
}

#[tokio::test]
async fn test_file_options_gate_writes() -> Result<()> {
    let net = TestNetwork::new(2, 1);
    let ctx = net.context()?;
    let cancel = CancellationToken::new();
    upload_bytes(&ctx, "/f.txt", b"x".to_vec(), UploadOptions::default()).await?;

    net.chain.update_allocation(|a| a.file_options.mask = FORBID_RENAME | FORBID_DELETE);
    ctx.refresh().await?;
    let err = ctx.rename("/f.txt", "g.txt", cancel.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    let err = ctx.delete("/f.txt", cancel.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    ctx.create_dir("/allowed", cancel.clone()).await?;

    net.chain.update_allocation(|a| a.file_options.mask = 1 << 10);
    ctx.refresh().await?;
    let err = ctx.create_dir("/denied", cancel.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);

    net.chain.update_allocation(|a| a.file_options.mask = 0);
    ctx.refresh().await?;
    ctx.rename("/f.txt", "g.txt", cancel).await?;
    Ok(())
}

#[tokio::test]
async fn test_non_owner_cannot_write() -> Result<()> {
    let net = TestNetwork::new(2, 1);
    let owner = net.context()?;
    upload_bytes(&owner, "/owned.txt", b"mine".to_vec(), UploadOptions::default()).await?;

    let other = net.context_with(net.core(Credentials::generate(), test_config())?)?;
    let err = other
        .delete("/owned.txt", CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    let err = upload_bytes(&other, "/theirs.txt", b"no".to_vec(), UploadOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    Ok(())
}

#[tokio::test]
async fn test_frozen_allocation_is_read_only() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let ctx = net.context()?;
    let data = random_bytes(1_500);
    upload_bytes(&ctx, "/frozen.bin", data.clone(), UploadOptions::default()).await?;

    net.chain.update_allocation(|a| a.status = AllocationStatus::Frozen);
    ctx.refresh().await?;
    assert_eq!(ctx.allocation().await.status, AllocationStatus::Frozen);
    let err = upload_bytes(&ctx, "/more.bin", random_bytes(10), UploadOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    assert_eq!(download_bytes(&ctx, "/frozen.bin", ByteRange::full()).await?, data);

    net.chain.update_allocation(|a| a.status = AllocationStatus::Active);
    ctx.refresh().await?;
    assert_eq!(ctx.allocation().await.status, AllocationStatus::Frozen);

    net.chain.update_allocation(|a| a.status = AllocationStatus::Cancelled);
    ctx.refresh().await?;
    let err = ctx.stat("/frozen.bin").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    Ok(())
}

#[tokio::test]
async fn test_file_stats_flags_divergent_blobbers() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let ctx = net.context()?;
    upload_bytes(&ctx, "/stats.bin", random_bytes(2_500), UploadOptions::default()).await?;
    net.node(1).drop_object("/stats.bin");
    net.node(3).kill();

    let stats = ctx.file_stats("/stats.bin").await?;
    assert_eq!(stats.len(), 4);
    assert!(stats[0].in_consensus && stats[2].in_consensus);
    assert!(!stats[1].in_consensus);
    assert_eq!(
        stats[1].error.as_ref().map(|e| e.code.as_str()),
        Some(ErrorKind::FileNotFound.as_code())
    );
    assert!(stats[3].meta.is_none() && stats[3].error.is_some());
    assert_eq!(stats[0].blobber_id, net.node(0).id());
    Ok(())
}
