use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::{
    codec::ColumnHasher,
    crypto::hash_parts,
    error::{Error, Result},
    fs::FileSystem,
};

pub const PROGRESS_VERSION: u32 = 2;

pub fn progress_id(allocation_id: &str, remote_path: &str, content_fingerprint: &str) -> String {
    hex::encode(hash_parts([
        allocation_id.as_bytes(),
        remote_path.as_bytes(),
        content_fingerprint.as_bytes(),
    ]))
}

fn current_version() -> u32 {
    PROGRESS_VERSION
}

/// Resumable state of one upload. Unknown fields are ignored on load so
/// that newer writers stay readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadProgress {
    #[serde(default = "current_version")]
    pub version: u32,
    pub progress_id: String,
    pub allocation_id: String,
    pub remote_path: String,
    pub content_fingerprint: String,
    pub chunk_size: usize,
    pub actual_size: u64,
    pub uploaded_chunks: u64,
    pub blobber_offsets: Vec<u64>,
    pub connection_ids: Vec<String>,
    /// Merkle frontier of each blobber's column over the acknowledged
    /// chunks.
    pub partial_hash_state: Vec<ColumnHasher>,
    /// Blobbers dropped from this upload after failing.
    #[serde(default)]
    pub failed_blobbers: Vec<usize>,
}

impl UploadProgress {
    pub fn new(
        allocation_id: &str,
        remote_path: &str,
        content_fingerprint: &str,
        chunk_size: usize,
        actual_size: u64,
        total_shards: usize,
    ) -> Self {
        Self {
            version: PROGRESS_VERSION,
            progress_id: progress_id(allocation_id, remote_path, content_fingerprint),
            allocation_id: allocation_id.to_string(),
            remote_path: remote_path.to_string(),
            content_fingerprint: content_fingerprint.to_string(),
            chunk_size,
            actual_size,
            uploaded_chunks: 0,
            blobber_offsets: vec![0; total_shards],
            connection_ids: vec![String::new(); total_shards],
            partial_hash_state: vec![ColumnHasher::default(); total_shards],
            failed_blobbers: vec![],
        }
    }

    /// A record resumes only if it describes the same chunking and its
    /// column state covers exactly the acknowledged chunks. The final chunk
    /// is never recorded as acknowledged.
    pub fn is_compatible(&self, chunk_size: usize, actual_size: u64, total_shards: usize) -> bool {
        let total_chunks = actual_size.div_ceil(chunk_size.max(1) as u64).max(1);
        self.chunk_size == chunk_size
            && self.actual_size == actual_size
            && self.uploaded_chunks < total_chunks
            && self.blobber_offsets.len() == total_shards
            && self.connection_ids.len() == total_shards
            && self.partial_hash_state.len() == total_shards
            && self
                .partial_hash_state
                .iter()
                .all(|c| c.len() == self.uploaded_chunks && c.is_consistent())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    Json,
    Cbor,
}

impl Encoding {
    fn encode(self, progress: &UploadProgress) -> Result<Vec<u8>> {
        match self {
            Encoding::Json => Ok(serde_json::to_vec(progress)?),
            Encoding::Cbor => {
                let mut buf = Vec::new();
                ciborium::into_writer(progress, &mut buf)
                    .map_err(|e| Error::internal(format!("cbor encode failed: {}", e)))?;
                Ok(buf)
            }
        }
    }

    /// JSON records always start with `{`; anything else is read as CBOR.
    fn decode(bytes: &[u8]) -> Result<UploadProgress> {
        if bytes.first() == Some(&b'{') {
            Ok(serde_json::from_slice(bytes)?)
        } else {
            ciborium::from_reader(bytes)
                .map_err(|e| Error::internal(format!("cbor decode failed: {}", e)))
        }
    }
}

type LockTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Exclusive hold on a progress id. The last holder removes the table entry.
pub struct ProgressLock {
    id: String,
    table: LockTable,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for ProgressLock {
    fn drop(&mut self) {
        if let Ok(mut table) = self.table.lock() {
            // The table and this guard own the only references.
            if table.get(&self.id).is_some_and(|l| Arc::strong_count(l) <= 2) {
                table.remove(&self.id);
            }
        }
    }
}

/// Persisted upload bookkeeping with exclusive access per progress id.
#[derive(Clone)]
pub struct ProgressStore {
    fs: Arc<dyn FileSystem>,
    encoding: Encoding,
    locks: LockTable,
}

impl ProgressStore {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            encoding: Encoding::default(),
            locks: Arc::default(),
        }
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn is_durable(&self) -> bool {
        self.fs.is_durable()
    }

    /// Holds the progress id until the guard is dropped. A second upload of
    /// the same content to the same path waits here.
    pub async fn lock(&self, id: &str) -> Result<ProgressLock> {
        let lock = self.entry(id)?;
        Ok(ProgressLock {
            id: id.to_string(),
            table: self.locks.clone(),
            _guard: lock.lock_owned().await,
        })
    }

    pub fn try_lock(&self, id: &str) -> Result<Option<ProgressLock>> {
        let lock = self.entry(id)?;
        Ok(lock.try_lock_owned().ok().map(|guard| ProgressLock {
            id: id.to_string(),
            table: self.locks.clone(),
            _guard: guard,
        }))
    }

    /// Number of progress ids currently held or awaited.
    pub fn lock_count(&self) -> usize {
        self.locks.lock().map(|table| table.len()).unwrap_or_default()
    }

    fn entry(&self, id: &str) -> Result<Arc<AsyncMutex<()>>> {
        Ok(self
            .locks
            .lock()
            .map_err(|_| Error::internal("progress lock table poisoned"))?
            .entry(id.to_string())
            .or_default()
            .clone())
    }

    pub async fn load(&self, id: &str) -> Result<Option<UploadProgress>> {
        let fs = self.fs.clone();
        let key = id.to_string();
        let bytes = tokio::task::spawn_blocking(move || fs.load_progress(&key)).await??;
        match bytes {
            Some(bytes) => {
                let progress = Encoding::decode(&bytes)?;
                debug!("Loaded progress {} at chunk {}", id, progress.uploaded_chunks);
                Ok(Some(progress))
            }
            None => Ok(None),
        }
    }

    pub async fn save(&self, progress: &UploadProgress) -> Result<()> {
        let bytes = self.encoding.encode(progress)?;
        let fs = self.fs.clone();
        let key = progress.progress_id.clone();
        tokio::task::spawn_blocking(move || fs.save_progress(&key, &bytes)).await?
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        let fs = self.fs.clone();
        let key = id.to_string();
        tokio::task::spawn_blocking(move || fs.remove_progress(&key)).await??;
        debug!("Removed progress {}", id);
        Ok(())
    }
}
