//! In-memory blobber network and chain for integration tests.

mod chain;
pub mod http;
mod node;

use std::{sync::Arc, time::Duration};

use rand::RngCore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use chain::MockChain;
pub use node::{Caller, MemoryBlobber, MemoryNode};

use crate::{
    allocation::{
        Allocation, AllocationContext, AllocationStatus, BlobberNode, DownloadOptions, FileOptions,
        OperationResult, UploadOptions,
    },
    config::SdkConfig,
    context::CoreContext,
    crypto::Credentials,
    download::ByteRange,
    error::Result,
    fs::{FileSystem, MemFile, MemFs},
    retry::RetryPolicy,
};

pub const STORAGE_SC_ADDRESS: &str =
    "6dba10422e368813802877a85039d3985d96760ed844092319743fb3a76712d7";

pub type TestContext = AllocationContext<MemoryBlobber, MockChain>;

/// Small chunks and short waits so multi-chunk paths run quickly.
pub fn test_config() -> SdkConfig {
    SdkConfig::builder()
        .chunk_size(1024)
        .prefetch(2)
        .window_blocks(4)
        .rpc_timeout(Duration::from_secs(5))
        .retry(RetryPolicy::fast(2))
        .query_sleep_time(Duration::from_millis(10))
        .max_txn_query(3)
        .block_cache_capacity(64)
        .build()
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

pub fn random_key() -> [u8; 32] {
    let mut key = [0; 32];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// One allocation spread over `data + parity` in-memory blobbers.
pub struct TestNetwork {
    pub allocation: Allocation,
    pub owner: Credentials,
    pub nodes: Vec<MemoryNode>,
    pub chain: MockChain,
    pub fs: MemFs,
}

impl TestNetwork {
    pub fn new(data_shards: usize, parity_shards: usize) -> Self {
        let owner = Credentials::generate();
        let allocation_id = Uuid::new_v4().simple().to_string();
        let nodes: Vec<MemoryNode> = (0..data_shards + parity_shards)
            .map(|i| {
                MemoryNode::new(
                    format!("blobber-{:02}-{}", i, &allocation_id[..8]),
                    &allocation_id,
                    &owner,
                    data_shards,
                    parity_shards,
                )
            })
            .collect();
        let allocation = Allocation {
            id: allocation_id,
            data_shards,
            parity_shards,
            size: 1 << 30,
            expiration: 0,
            owner_id: owner.client_id.clone(),
            owner_public_key: owner.public_key.clone(),
            read_price: 0,
            write_price: 0,
            file_options: FileOptions::default(),
            blobbers: nodes
                .iter()
                .map(|n| BlobberNode {
                    id: n.id().to_string(),
                    base_url: format!("memory://{}", n.id()),
                    weight: 1,
                    last_health: None,
                })
                .collect(),
            status: AllocationStatus::Active,
        };
        Self {
            chain: MockChain::new(allocation.clone()),
            allocation,
            owner,
            nodes,
            fs: MemFs::new(),
        }
    }

    pub fn node(&self, index: usize) -> &MemoryNode {
        &self.nodes[index]
    }

    pub fn blobbers(&self, credentials: &Credentials) -> Vec<MemoryBlobber> {
        self.nodes.iter().map(|n| n.client(credentials)).collect()
    }

    pub fn core(&self, credentials: Credentials, config: SdkConfig) -> Result<CoreContext> {
        let fs: Arc<dyn FileSystem> = Arc::new(self.fs.clone());
        CoreContext::new(Some(credentials), fs, config)
    }

    /// Owner context over the shared [`MemFs`].
    pub fn context(&self) -> Result<TestContext> {
        self.context_with(self.core(self.owner.clone(), test_config())?)
    }

    pub fn context_with(&self, core: CoreContext) -> Result<TestContext> {
        let blobbers = self.blobbers(&core.credentials);
        let allocation = self.allocation.clone();
        AllocationContext::new(allocation, blobbers, core, self.chain.clone(), STORAGE_SC_ADDRESS)
    }
}

pub async fn upload_bytes(
    context: &TestContext,
    remote_path: &str,
    bytes: Vec<u8>,
    options: UploadOptions,
) -> Result<OperationResult> {
    let size = bytes.len() as u64;
    context
        .upload(
            Box::new(MemFile::new(bytes)),
            size,
            remote_path,
            options,
            CancellationToken::new(),
        )
        .await
}

pub async fn download_bytes(context: &TestContext, remote_path: &str, range: ByteRange) -> Result<Vec<u8>> {
    let mut sink = Vec::new();
    let options = DownloadOptions::builder().range(range).build();
    context
        .download(remote_path, &mut sink, options, CancellationToken::new())
        .await?;
    Ok(sink)
}
