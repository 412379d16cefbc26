use std::collections::BTreeMap;

use anyhow::Result;
use shardbox::{
    allocation::UploadOptions,
    blobber::{BlobberApi, ReadRequest, ReadTarget},
    codec::{Codec, CodecParams, ShardCipher, encryption::TAG_SIZE},
    download::ByteRange,
    error::ErrorKind,
    test_utils::{TestContext, TestNetwork, download_bytes, random_bytes, random_key, test_config, upload_bytes},
};

fn keyed_context(net: &TestNetwork, key: Option<[u8; 32]>) -> Result<TestContext> {
    let core = net.core(net.owner.clone(), test_config())?;
    let core = match key {
        Some(key) => core.with_encryption_key(key),
        None => core,
    };
    Ok(net.context_with(core)?)
}

fn encrypted() -> UploadOptions {
    UploadOptions::builder().encrypt(true).build()
}

#[tokio::test]
async fn test_encrypted_round_trip() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let key = random_key();
    let ctx = keyed_context(&net, Some(key))?;
    let data = random_bytes(10_000);
    upload_bytes(&ctx, "/secret.bin", data.clone(), encrypted()).await?;

    let meta = ctx.stat("/secret.bin").await?;
    assert!(meta.encrypted_key.is_some());
    assert_eq!(meta.stored_shard_size(), 512 + TAG_SIZE as u64);
    assert_eq!(download_bytes(&ctx, "/secret.bin", ByteRange::full()).await?, data);
    assert_eq!(
        download_bytes(&ctx, "/secret.bin", ByteRange::new(3_000, Some(3_099))).await?,
        data[3_000..3_100]
    );

    net.node(0).kill();
    net.node(3).kill();
    ctx.core().cache.clear();
    assert_eq!(download_bytes(&ctx, "/secret.bin", ByteRange::full()).await?, data);
    Ok(())
}

#[tokio::test]
async fn test_encrypted_reads_need_the_key() -> Result<()> {
    let net = TestNetwork::new(2, 1);
    let ctx = keyed_context(&net, Some(random_key()))?;
    upload_bytes(&ctx, "/locked.bin", random_bytes(2_000), encrypted()).await?;

    let keyless = keyed_context(&net, None)?;
    let err = download_bytes(&keyless, "/locked.bin", ByteRange::full()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);

    let wrong = keyed_context(&net, Some(random_key()))?;
    let err = download_bytes(&wrong, "/locked.bin", ByteRange::full()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);

    let err = upload_bytes(&keyless, "/plain.bin", random_bytes(10), encrypted())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    Ok(())
}

#[tokio::test]
async fn test_one_blobber_learns_nothing() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let key = random_key();
    let ctx = keyed_context(&net, Some(key))?;
    let data = random_bytes(1024);
    upload_bytes(&ctx, "/isolated.bin", data.clone(), encrypted()).await?;
    let meta = ctx.stat("/isolated.bin").await?;

    let read = net
        .node(0)
        .client(&net.owner)
        .read_shard(ReadRequest {
            target: ReadTarget::path("/isolated.bin"),
            start_block: 0,
            num_blocks: 1,
            thumbnail: false,
        })
        .await?;
    assert_eq!(read.data.len(), 512 + TAG_SIZE);
    assert_ne!(&read.data[..512], &data[..512]);

    let ids = net.allocation.blobber_ids();
    let cipher = ShardCipher::new(&key, &net.allocation.id, &meta.content_hash, &ids)?;
    assert_eq!(cipher.decrypt(0, 0, &read.data)?, data[..512]);
    let err = cipher.decrypt(0, 1, &read.data).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptedShards);

    let codec = Codec::new(CodecParams::new(2, 2, 1024)?, Some(cipher))?;
    let lone = BTreeMap::from([(0, read.data.clone())]);
    let err = codec.decode_chunk(0, &lone, 1024).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConsensusNotReached);
    Ok(())
}
