use anyhow::Result;
use shardbox::{
    allocation::{DownloadOptions, UploadOptions},
    config::SdkConfig,
    crypto::Credentials,
    download::ByteRange,
    error::ErrorKind,
    marker::{AuthTicket, ReferenceType, now_unix},
    test_utils::{TestContext, TestNetwork, download_bytes, random_bytes, test_config, upload_bytes},
};
use tokio_util::sync::CancellationToken;

fn config() -> SdkConfig {
    let mut config = test_config();
    config.chunk_size = 64 * 1024;
    config
}

fn context_for(net: &TestNetwork, credentials: Credentials) -> Result<TestContext> {
    Ok(net.context_with(net.core(credentials, config())?)?)
}

async fn fetch(ctx: &TestContext, ticket: &str, path: Option<&str>) -> shardbox::error::Result<Vec<u8>> {
    let mut sink = Vec::new();
    ctx.download_shared(
        ticket,
        path.map(str::to_string),
        &mut sink,
        DownloadOptions::default(),
        CancellationToken::new(),
    )
    .await?;
    Ok(sink)
}

#[tokio::test]
async fn test_ticket_grants_referee_read() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let owner = context_for(&net, net.owner.clone())?;
    let data = random_bytes(1024 * 1024);
    upload_bytes(&owner, "/movie.bin", data.clone(), UploadOptions::default()).await?;

    let receiver = Credentials::generate();
    let ctx = context_for(&net, receiver.clone())?;
    let ticket = owner
        .share("/movie.bin", Some(&receiver.client_id), now_unix() + 3600, None)
        .await?;
    assert_eq!(fetch(&ctx, &ticket, None).await?, data);

    let err = ctx
        .download("/movie.bin", &mut Vec::new(), DownloadOptions::default(), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let stranger = context_for(&net, Credentials::generate())?;
    let err = fetch(&stranger, &ticket, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthTicketDecodeError);
    Ok(())
}

#[tokio::test]
async fn test_open_ticket_serves_ranges() -> Result<()> {
    let net = TestNetwork::new(3, 2);
    let owner = context_for(&net, net.owner.clone())?;
    let data = random_bytes(300 * 1024);
    upload_bytes(&owner, "/open.bin", data.clone(), UploadOptions::default()).await?;
    let ticket = owner.share("/open.bin", None, 0, None).await?;

    let ctx = context_for(&net, Credentials::generate())?;
    let mut sink = Vec::new();
    let options = DownloadOptions::builder()
        .range(ByteRange::new(100_000, Some(199_999)))
        .build();
    let report = ctx
        .download_shared(&ticket, None, &mut sink, options, CancellationToken::new())
        .await?;
    assert_eq!(report.bytes_written, 100_000);
    assert_eq!(sink, data[100_000..200_000]);
    Ok(())
}

#[tokio::test]
async fn test_expired_ticket_is_refused() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let owner = context_for(&net, net.owner.clone())?;
    upload_bytes(&owner, "/old.bin", random_bytes(5_000), UploadOptions::default()).await?;
    let meta = owner.stat("/old.bin").await?;

    let err = owner
        .share("/old.bin", None, now_unix() - 10, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);

    let expired = AuthTicket {
        client_id: String::new(),
        owner_id: net.owner.client_id.clone(),
        allocation_id: net.allocation.id.clone(),
        file_path_hash: meta.lookup_hash.clone(),
        actual_file_hash: meta.content_hash.clone(),
        file_name: meta.name.clone(),
        reference_type: ReferenceType::File,
        expiration: now_unix() - 10,
        encryption_public_key: None,
        signature: String::new(),
    }
    .sign(&net.owner)?
    .encode()?;
    let ctx = context_for(&net, Credentials::generate())?;
    let err = fetch(&ctx, &expired, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthTicketDecodeError);

    let forged = AuthTicket {
        expiration: now_unix() + 3600,
        signature: String::new(),
        ..AuthTicket::decode(&expired)?
    }
    .sign(&Credentials::generate())?
    .encode()?;
    let err = fetch(&ctx, &forged, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthTicketDecodeError);

    let err = fetch(&ctx, "not a ticket", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthTicketDecodeError);
    Ok(())
}

#[tokio::test]
async fn test_directory_ticket_covers_its_subtree() -> Result<()> {
    let net = TestNetwork::new(2, 1);
    let owner = context_for(&net, net.owner.clone())?;
    let report = random_bytes(2_000);
    upload_bytes(&owner, "/docs/report.pdf", report.clone(), UploadOptions::default()).await?;
    upload_bytes(&owner, "/private.txt", b"secret".to_vec(), UploadOptions::default()).await?;

    let ticket = owner.share("/docs", None, 0, None).await?;
    let ctx = context_for(&net, Credentials::generate())?;
    assert_eq!(fetch(&ctx, &ticket, Some("/docs/report.pdf")).await?, report);

    let err = fetch(&ctx, &ticket, Some("/private.txt")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let file_ticket = owner.share("/private.txt", None, 0, None).await?;
    let err = fetch(&ctx, &file_ticket, Some("/docs/report.pdf")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    Ok(())
}

#[tokio::test]
async fn test_only_owner_shares() -> Result<()> {
    let net = TestNetwork::new(2, 1);
    let owner = context_for(&net, net.owner.clone())?;
    upload_bytes(&owner, "/mine.bin", random_bytes(100), UploadOptions::default()).await?;
    let other = context_for(&net, Credentials::generate())?;
    let err = other.share("/mine.bin", None, 0, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    assert_eq!(download_bytes(&owner, "/mine.bin", ByteRange::full()).await?.len(), 100);
    Ok(())
}
