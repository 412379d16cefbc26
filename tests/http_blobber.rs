use std::time::Duration;

use anyhow::Result;
use shardbox::{
    allocation::{AllocationContext, DownloadOptions, UploadOptions},
    blobber::{BlobberApi, HttpBlobber},
    crypto::Credentials,
    error::ErrorKind,
    fs::MemFile,
    test_utils::{MockChain, STORAGE_SC_ADDRESS, TestNetwork, http, random_bytes, test_config},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type HttpContext = AllocationContext<HttpBlobber, MockChain>;

struct Served {
    urls: Vec<String>,
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Served {
    async fn start(net: &TestNetwork) -> Result<Self> {
        let cancel = CancellationToken::new();
        let mut urls = vec![];
        let mut handles = vec![];
        for node in &net.nodes {
            let (url, handle) = http::serve(node.clone(), cancel.clone()).await?;
            urls.push(url);
            handles.push(handle);
        }
        Ok(Self {
            urls,
            handles,
            cancel,
        })
    }

    fn context(&self, net: &TestNetwork, credentials: Credentials) -> Result<HttpContext> {
        let blobbers = net
            .nodes
            .iter()
            .zip(&self.urls)
            .map(|(node, url)| {
                HttpBlobber::new(
                    node.id(),
                    url.clone(),
                    &net.allocation.id,
                    credentials.clone(),
                    Duration::from_secs(5),
                )
            })
            .collect::<shardbox::error::Result<Vec<_>>>()?;
        let core = net.core(credentials, test_config())?;
        Ok(AllocationContext::new(
            net.allocation.clone(),
            blobbers,
            core,
            net.chain.clone(),
            STORAGE_SC_ADDRESS,
        )?)
    }

    async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        for handle in self.handles {
            handle.await?;
        }
        Ok(())
    }
}

async fn upload(ctx: &HttpContext, path: &str, bytes: &[u8], options: UploadOptions) -> Result<()> {
    ctx.upload(
        Box::new(MemFile::new(bytes.to_vec())),
        bytes.len() as u64,
        path,
        options,
        CancellationToken::new(),
    )
    .await?;
    Ok(())
}

async fn download(ctx: &HttpContext, path: &str) -> shardbox::error::Result<Vec<u8>> {
    let mut sink = Vec::new();
    ctx.download(path, &mut sink, DownloadOptions::default(), CancellationToken::new())
        .await?;
    Ok(sink)
}

#[tokio::test]
async fn test_round_trip_over_http() -> Result<()> {
    let net = TestNetwork::new(2, 2);
    let served = Served::start(&net).await?;
    let ctx = served.context(&net, net.owner.clone())?;

    let data = random_bytes(9_000);
    let thumbnail = random_bytes(200);
    let options = UploadOptions::builder().thumbnail(thumbnail.clone()).build();
    upload(&ctx, "/remote/file.bin", &data, options).await?;
    assert_eq!(net.chain.transactions().len(), 1);
    for node in &net.nodes {
        assert!(node.object("/remote/file.bin").is_some());
    }

    assert_eq!(download(&ctx, "/remote/file.bin").await?, data);
    assert_eq!(ctx.thumbnail("/remote/file.bin", CancellationToken::new()).await?, thumbnail);
    assert_eq!(ctx.list("/remote").await?.len(), 1);

    ctx.rename("/remote/file.bin", "renamed.bin", CancellationToken::new())
        .await?;
    net.node(1).kill();
    ctx.core().cache.clear();
    assert_eq!(download(&ctx, "/remote/renamed.bin").await?, data);

    served.stop().await
}

#[tokio::test]
async fn test_requests_are_authenticated() -> Result<()> {
    let net = TestNetwork::new(2, 1);
    let served = Served::start(&net).await?;
    let owner = served.context(&net, net.owner.clone())?;
    upload(&owner, "/private.bin", &random_bytes(500), UploadOptions::default()).await?;

    let stranger = served.context(&net, Credentials::generate())?;
    let err = download(&stranger, "/private.bin").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let blobber = &stranger.blobbers()[0];
    let err = blobber.new_connection("intruder").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let ticket = owner.share("/private.bin", None, 0, None).await?;
    let mut sink = Vec::new();
    stranger
        .download_shared(&ticket, None, &mut sink, DownloadOptions::default(), CancellationToken::new())
        .await?;
    assert_eq!(sink.len(), 500);

    served.stop().await
}

#[tokio::test]
async fn test_root_reflects_commits() -> Result<()> {
    let net = TestNetwork::new(2, 1);
    let served = Served::start(&net).await?;
    let ctx = served.context(&net, net.owner.clone())?;
    let before = ctx.blobbers()[0].latest_root().await?;
    assert_eq!(before.allocation_root, net.node(0).root());

    upload(&ctx, "/bump.bin", b"bump", UploadOptions::default()).await?;
    let after = ctx.blobbers()[0].latest_root().await?;
    assert_ne!(after.allocation_root, before.allocation_root);
    assert_eq!(after.allocation_root, net.node(0).root());

    served.stop().await
}
