use anyhow::Result;
use shardbox::{
    allocation::UploadOptions,
    blobber::BlobberApi,
    download::ByteRange,
    error::ErrorKind,
    marker::{WriteMarker, empty_allocation_root, next_allocation_root},
    test_utils::{TestNetwork, download_bytes, random_bytes, upload_bytes},
};
use tokio_util::sync::CancellationToken;

fn genesis_marker(net: &TestNetwork, blobber: usize, timestamp: i64) -> Result<WriteMarker> {
    let blobber_id = net.node(blobber).id().to_string();
    let prev = empty_allocation_root(&net.allocation.id, &blobber_id);
    Ok(WriteMarker {
        allocation_root: next_allocation_root(&prev, "", timestamp),
        prev_allocation_root: prev,
        allocation_id: net.allocation.id.clone(),
        blobber_id,
        client_id: net.owner.client_id.clone(),
        size: 0,
        timestamp,
        operation: "Upload".to_string(),
        signature: String::new(),
    }
    .sign(&net.owner)?)
}

#[tokio::test]
async fn test_finalize_is_idempotent() -> Result<()> {
    let net = TestNetwork::new(2, 1);
    let blobber = net.node(0).client(&net.owner);
    let connection = blobber.new_connection("same-key").await?;
    assert_eq!(blobber.new_connection("same-key").await?, connection);

    let marker = genesis_marker(&net, 0, 1_700_000_000)?;
    let first = blobber.finalize(&connection, marker.clone()).await?;
    let second = blobber.finalize(&connection, marker.clone()).await?;
    assert_eq!(first.allocation_root, second.allocation_root);
    assert_eq!(net.node(0).root(), marker.allocation_root);

    let other = WriteMarker {
        timestamp: marker.timestamp + 1,
        signature: String::new(),
        ..marker
    }
    .sign(&net.owner)?;
    let err = blobber.finalize(&connection, other).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WriteMarkerValidationFailed);
    Ok(())
}

#[tokio::test]
async fn test_marker_from_stranger_is_rejected() -> Result<()> {
    let net = TestNetwork::new(2, 1);
    let blobber = net.node(1).client(&net.owner);
    let connection = blobber.new_connection("k").await?;
    let mut marker = genesis_marker(&net, 1, 1_700_000_000)?;
    marker.signature = genesis_marker(&net, 0, 1_700_000_000)?.signature;
    let err = blobber.finalize(&connection, marker).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WriteMarkerValidationFailed);

    let wrong_blobber = genesis_marker(&net, 0, 1_700_000_000)?;
    let err = blobber.finalize(&connection, wrong_blobber).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WriteMarkerValidationFailed);
    Ok(())
}

#[tokio::test]
async fn test_commit_binding_is_idempotent() -> Result<()> {
    let net = TestNetwork::new(2, 1);
    let ctx = net.context()?;
    let markers = (0..3)
        .map(|i| genesis_marker(&net, i, 1_700_000_000))
        .collect::<Result<Vec<_>>>()?;

    let first = ctx
        .binder()
        .commit(&net.allocation.id, &markers, CancellationToken::new())
        .await?;
    let second = ctx
        .binder()
        .commit(&net.allocation.id, &markers, CancellationToken::new())
        .await?;
    assert_eq!(first, second);
    assert_eq!(net.chain.transactions().len(), 1);
    assert_eq!(net.chain.submissions(), 2);

    let err = ctx
        .binder()
        .commit(&net.allocation.id, &[], CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    Ok(())
}

#[tokio::test]
async fn test_submission_failure_is_retried() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let ctx = net.context()?;
    net.chain.fail_submissions(1);
    let data = random_bytes(3_000);
    upload_bytes(&ctx, "/retried.bin", data.clone(), UploadOptions::default()).await?;
    assert_eq!(net.chain.submissions(), 2);
    assert_eq!(net.chain.transactions().len(), 1);
    assert_eq!(download_bytes(&ctx, "/retried.bin", ByteRange::full()).await?, data);
    Ok(())
}

#[tokio::test]
async fn test_rejected_transaction_rolls_back() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let ctx = net.context()?;
    upload_bytes(&ctx, "/kept.bin", random_bytes(1_000), UploadOptions::default()).await?;
    let roots: Vec<String> = net.nodes.iter().map(|n| n.root()).collect();
    let open: Vec<usize> = net.nodes.iter().map(|n| n.open_connections()).collect();

    net.chain.reject_with(Some("allocation frozen"));
    let err = upload_bytes(&ctx, "/dropped.bin", random_bytes(2_000), UploadOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransactionVerifyError);
    for ((node, root), open) in net.nodes.iter().zip(&roots).zip(&open) {
        assert_eq!(&node.root(), root);
        assert!(node.object("/dropped.bin").is_none());
        assert!(node.object("/kept.bin").is_some());
        assert_eq!(node.open_connections(), *open);
    }

    net.chain.reject_with(None);
    let data = random_bytes(2_000);
    upload_bytes(&ctx, "/dropped.bin", data.clone(), UploadOptions::default()).await?;
    assert_eq!(download_bytes(&ctx, "/dropped.bin", ByteRange::full()).await?, data);
    Ok(())
}

#[tokio::test]
async fn test_stale_root_conflict_recovers_after_refresh() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let ctx_a = net.context()?;
    let ctx_b = net.context()?;
    upload_bytes(&ctx_a, "/shared.txt", b"v1".to_vec(), UploadOptions::default()).await?;
    let primed = ctx_b.latest_roots().await;
    assert!(primed.iter().all(Option::is_some));

    let update = UploadOptions::builder().update(true).build();
    upload_bytes(&ctx_a, "/shared.txt", b"v2 from a".to_vec(), update.clone()).await?;
    let transactions = net.chain.transactions().len();

    let err = upload_bytes(&ctx_b, "/shared.txt", b"v2 from b".to_vec(), update.clone())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConsensusFailed);
    assert_eq!(net.chain.transactions().len(), transactions);
    assert_eq!(
        download_bytes(&ctx_a, "/shared.txt", ByteRange::full()).await?,
        b"v2 from a"
    );

    ctx_b.refresh().await?;
    upload_bytes(&ctx_b, "/shared.txt", b"v2 from b".to_vec(), update).await?;
    ctx_a.invalidate(&["/shared.txt".to_string()]).await;
    assert_eq!(
        download_bytes(&ctx_a, "/shared.txt", ByteRange::full()).await?,
        b"v2 from b"
    );
    Ok(())
}
