pub mod client;

use serde::{Deserialize, Serialize};

use crate::{
    codec::MerkleProof,
    crypto::{Credentials, hash_hex},
    error::Result,
    marker::{FileOp, WriteMarker, now_unix},
};

pub use client::HttpBlobber;

pub const HEADER_CLIENT_ID: &str = "X-App-Client-ID";
pub const HEADER_CLIENT_KEY: &str = "X-App-Client-Key";
pub const HEADER_SIGNATURE: &str = "X-App-Client-Signature";
pub const HEADER_SIGNATURE_V2: &str = "X-App-Client-Signature-V2";
pub const HEADER_TIMESTAMP: &str = "X-App-Timestamp";
pub const HEADER_IDEMPOTENCY_KEY: &str = "X-App-Idempotency-Key";

/// Base64 encoding of byte payloads inside JSON bodies.
pub mod b64 {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailMeta {
    pub size: u64,
    pub shard_size: u64,
    pub shard_hashes: Vec<String>,
}

/// Remote object as a blobber reports it. All blobbers holding the same
/// committed object report identical metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub path: String,
    pub name: String,
    pub lookup_hash: String,
    pub object_type: ObjectType,
    pub actual_size: u64,
    pub chunk_size: u64,
    pub num_chunks: u64,
    pub data_shards: usize,
    pub parity_shards: usize,
    pub content_hash: String,
    pub validation_root: String,
    /// Column root of every blobber, in roster order.
    pub shard_roots: Vec<String>,
    /// Fingerprint of the encryption key; absent for plaintext objects.
    pub encrypted_key: Option<String>,
    pub thumbnail: Option<ThumbnailMeta>,
    pub mime_type: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl FileMeta {
    pub fn is_dir(&self) -> bool {
        self.object_type == ObjectType::Dir
    }

    /// Digest metadata reads vote on.
    pub fn meta_hash(&self) -> String {
        hash_hex(serde_json::to_vec(self).unwrap_or_default())
    }

    pub fn stored_shard_size(&self) -> u64 {
        let shard = self.chunk_size.div_ceil(self.data_shards.max(1) as u64);
        if self.encrypted_key.is_some() {
            shard + crate::codec::encryption::TAG_SIZE as u64
        } else {
            shard
        }
    }
}

/// Per-chunk metadata sent with every `write_chunk`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMeta {
    pub path: String,
    pub operation: FileOp,
    pub actual_size: u64,
    pub chunk_index: u64,
    pub is_final: bool,
    pub content_hash: String,
    /// Object record to commit, sent with the final chunk only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteChunkRequest {
    pub connection_id: String,
    pub meta: UploadMeta,
    #[serde(with = "b64")]
    pub shard: Vec<u8>,
    pub shard_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteChunkResponse {
    pub accepted: bool,
    /// Latest committed allocation root of the blobber.
    pub current_root: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StagedChange {
    Delete { path: String },
    Rename { path: String, new_name: String },
    Copy { path: String, dest_dir: String },
    Move { path: String, dest_dir: String },
    CreateDir { path: String },
}

impl StagedChange {
    pub fn operation(&self) -> FileOp {
        match self {
            StagedChange::Delete { .. } => FileOp::Delete,
            StagedChange::Rename { .. } => FileOp::Rename,
            StagedChange::Copy { .. } => FileOp::Copy,
            StagedChange::Move { .. } => FileOp::Move,
            StagedChange::CreateDir { .. } => FileOp::CreateDir,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            StagedChange::Delete { path }
            | StagedChange::Rename { path, .. }
            | StagedChange::Copy { path, .. }
            | StagedChange::Move { path, .. }
            | StagedChange::CreateDir { path } => path,
        }
    }

    pub fn dest_path(&self) -> Option<String> {
        match self {
            StagedChange::Rename { path, new_name } => {
                Some(crate::paths::join(crate::paths::parent(path), new_name))
            }
            StagedChange::Copy { path, dest_dir } | StagedChange::Move { path, dest_dir } => {
                Some(crate::paths::join(dest_dir, crate::paths::file_name(path)))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitAck {
    pub allocation_root: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootInfo {
    pub allocation_root: String,
    pub timestamp: i64,
}

/// What a read is authorized by: the owner's path or a shared ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum ReadTarget {
    Path { path: String },
    Ticket {
        ticket: String,
        /// Object under a shared directory; `None` for a shared file.
        #[serde(default)]
        path: Option<String>,
    },
}

impl ReadTarget {
    pub fn path(path: impl Into<String>) -> Self {
        ReadTarget::Path { path: path.into() }
    }

    /// Path used when signing the request.
    pub fn signing_path(&self) -> &str {
        match self {
            ReadTarget::Path { path } => path,
            ReadTarget::Ticket { path: Some(path), .. } => path,
            ReadTarget::Ticket { path: None, .. } => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub target: ReadTarget,
    pub start_block: u64,
    pub num_blocks: u64,
    #[serde(default)]
    pub thumbnail: bool,
}

/// Shards of consecutive blocks from one blobber, each with its inclusion
/// proof in the blobber's column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRead {
    #[serde(with = "b64")]
    pub data: Vec<u8>,
    pub proofs: Vec<MerkleProof>,
}

/// Identity headers attached to every blobber request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestAuth {
    pub client_id: String,
    pub public_key: String,
    pub signature: String,
    pub signature_v2: String,
    pub timestamp: i64,
    pub idempotency_key: String,
}

pub fn request_hash(path: &str, allocation_id: &str) -> String {
    hash_hex(format!("{}{}", path, allocation_id))
}

pub fn request_hash_v2(path: &str, allocation_id: &str, timestamp: i64) -> String {
    hash_hex(format!("{}:{}:{}", allocation_id, path, timestamp))
}

impl RequestAuth {
    pub fn sign(
        credentials: &Credentials,
        allocation_id: &str,
        path: &str,
        idempotency_key: impl Into<String>,
    ) -> Result<Self> {
        let timestamp = now_unix();
        Ok(Self {
            client_id: credentials.client_id.clone(),
            public_key: credentials.public_key.clone(),
            signature: credentials.sign(&request_hash(path, allocation_id))?,
            signature_v2: credentials.sign(&request_hash_v2(path, allocation_id, timestamp))?,
            timestamp,
            idempotency_key: idempotency_key.into(),
        })
    }
}

/// RPC surface of one blobber, bound to one allocation and one client
/// identity.
pub trait BlobberApi: Send + Sync + Clone + 'static {
    fn id(&self) -> &str;

    /// Opens, or reopens, the connection owned by `idempotency_key`.
    fn new_connection(&self, idempotency_key: &str)
    -> impl Future<Output = Result<String>> + Send;

    fn write_chunk(
        &self,
        request: WriteChunkRequest,
    ) -> impl Future<Output = Result<WriteChunkResponse>> + Send;

    fn stage(
        &self,
        connection_id: &str,
        change: StagedChange,
    ) -> impl Future<Output = Result<()>> + Send;

    fn finalize(
        &self,
        connection_id: &str,
        marker: WriteMarker,
    ) -> impl Future<Output = Result<CommitAck>> + Send;

    /// Discards a staged connection, or reverts it if it was already
    /// finalized.
    fn rollback(&self, connection_id: &str) -> impl Future<Output = Result<()>> + Send;

    fn read_shard(&self, request: ReadRequest) -> impl Future<Output = Result<ShardRead>> + Send;

    fn stat(&self, target: ReadTarget) -> impl Future<Output = Result<FileMeta>> + Send;

    fn list(&self, target: ReadTarget) -> impl Future<Output = Result<Vec<FileMeta>>> + Send;

    fn latest_root(&self) -> impl Future<Output = Result<RootInfo>> + Send;

    fn delete(&self, connection_id: &str, path: &str) -> impl Future<Output = Result<()>> + Send {
        self.stage(
            connection_id,
            StagedChange::Delete {
                path: path.to_string(),
            },
        )
    }
}
