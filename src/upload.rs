//! Upload orchestrator: chunks the source, fans shards out to one worker
//! per blobber and stages the object on every blobber that keeps up. The
//! commit itself is driven by the allocation context.

use std::{
    collections::BTreeMap,
    io::{Read, Seek, SeekFrom},
    sync::Arc,
    time::Duration,
};

use futures_util::future::join_all;
use sha2::{Digest, Sha256};
use tokio::{
    select,
    sync::mpsc,
    task::{JoinHandle, JoinSet},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    allocation::Allocation,
    blobber::{BlobberApi, FileMeta, ObjectType, ThumbnailMeta, UploadMeta, WriteChunkRequest},
    codec::{ChunkGroup, Codec, CodecParams, ColumnHasher, ShardCipher, key_fingerprint, merkle_root_hex},
    consensus::write_consensus,
    context::CoreContext,
    crypto::lookup_hash,
    error::{Error, ErrorKind, Result},
    events::{OperationKind, StatusEvent},
    fs::FileHandle,
    marker::{ChangeRecord, FileOp, now_unix},
    paths,
    progress::{ProgressLock, UploadProgress, progress_id},
    retry::{RetryPolicy, new_backoff, retry},
};

pub struct UploadRequest {
    pub remote_path: String,
    /// `Upload` for a new object, `Update` to replace an existing one.
    pub operation: FileOp,
    pub source: Box<dyn FileHandle>,
    pub actual_size: u64,
    pub mime_type: String,
    pub thumbnail: Option<Vec<u8>>,
    pub encrypt: bool,
    /// Creation time to keep when replacing an object.
    pub created_at: Option<i64>,
}

/// An object written to every agreeing blobber and waiting for its write
/// markers. Holds the progress lock until dropped.
pub struct StagedUpload {
    pub progress_id: String,
    pub file: FileMeta,
    pub operation: FileOp,
    pub connections: Vec<Option<String>>,
    pub agreeing: Vec<usize>,
    pub tree_root: String,
    _lock: ProgressLock,
}

impl StagedUpload {
    pub fn change_for(&self, blobber: usize) -> ChangeRecord {
        ChangeRecord {
            operation: self.operation,
            path: self.file.path.clone(),
            dest_path: None,
            size: self.file.actual_size as i64,
            content_root: self.file.shard_roots.get(blobber).cloned().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WorkerSettings {
    rpc_timeout: Duration,
    chunk_budget: Duration,
    retry: RetryPolicy,
}

struct ChunkJob {
    group: Arc<ChunkGroup>,
    meta: Arc<UploadMeta>,
    thumbnails: Option<Arc<Vec<Vec<u8>>>>,
}

struct ChunkResult {
    blobber: usize,
    chunk_index: u64,
    result: Result<String>,
}

struct PendingChunk {
    expected: usize,
    results: Vec<(usize, Result<String>)>,
    hashes: Vec<String>,
    file: Option<FileMeta>,
}

pub struct Uploader<'a, B> {
    allocation: &'a Allocation,
    blobbers: &'a [B],
    core: &'a CoreContext,
    cancel: CancellationToken,
}

/// SHA-256 of the whole source; doubles as the content fingerprint.
async fn fingerprint(source: Box<dyn FileHandle>, expected: u64) -> Result<(String, Box<dyn FileHandle>)> {
    tokio::task::spawn_blocking(move || {
        let mut source = source;
        source.seek(SeekFrom::Start(0))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = source.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as u64;
        }
        if total != expected {
            return Err(Error::invalid_parameter(format!(
                "source holds {} bytes, {} declared",
                total, expected
            )));
        }
        Ok((hex::encode(hasher.finalize()), source))
    })
    .await?
}

fn encode_thumbnail(
    bytes: &[u8],
    data_shards: usize,
    parity_shards: usize,
) -> Result<(ThumbnailMeta, Vec<Vec<u8>>)> {
    let params = CodecParams::new(data_shards, parity_shards, bytes.len().max(1))?;
    let group = Codec::new(params, None)?.encode_chunk(0, bytes, true)?;
    Ok((
        ThumbnailMeta {
            size: bytes.len() as u64,
            shard_size: params.shard_size() as u64,
            shard_hashes: group.shard_hashes,
        },
        group.shards,
    ))
}

fn spawn_producer(
    codec: Codec,
    mut source: Box<dyn FileHandle>,
    actual_size: u64,
    start_chunk: u64,
    tx: mpsc::Sender<Result<ChunkGroup>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let offset = start_chunk * codec.params().chunk_size as u64;
        if let Err(e) = source.seek(SeekFrom::Start(offset)) {
            let _ = tx.blocking_send(Err(e.into()));
            return;
        }
        for group in codec.encode_file(source, actual_size, start_chunk) {
            if cancel.is_cancelled() || tx.blocking_send(group).is_err() {
                break;
            }
        }
    })
}

async fn write_with_retry<B: BlobberApi>(
    index: usize,
    blobber: &B,
    connection_id: &str,
    job: &ChunkJob,
    settings: WorkerSettings,
    cancel: CancellationToken,
) -> Result<String> {
    let action = format!("write chunk {} to {}", job.group.chunk_index, blobber.id());
    let attempt = || {
        let request = WriteChunkRequest {
            connection_id: connection_id.to_string(),
            meta: (*job.meta).clone(),
            shard: job.group.shards[index].clone(),
            shard_hash: job.group.shard_hashes[index].clone(),
            thumbnail: job.thumbnails.as_ref().map(|t| t[index].clone()),
        };
        let blobber = blobber.clone();
        async move {
            let response = timeout(settings.rpc_timeout, blobber.write_chunk(request)).await??;
            if !response.accepted {
                return Err(Error::new(
                    ErrorKind::Conflict,
                    format!("{} refused the chunk", blobber.id()),
                ));
            }
            Ok(response.current_root)
        }
    };
    timeout(
        settings.chunk_budget,
        retry(attempt, &action, new_backoff(&settings.retry), cancel),
    )
    .await?
}

/// Sends every job of one blobber in order. After the first failure the
/// blobber is out of this upload and remaining jobs fail fast.
async fn run_worker<B: BlobberApi>(
    index: usize,
    blobber: B,
    connection_id: String,
    mut jobs: mpsc::Receiver<ChunkJob>,
    results: mpsc::UnboundedSender<ChunkResult>,
    settings: WorkerSettings,
    cancel: CancellationToken,
) {
    let mut failure: Option<Error> = None;
    loop {
        let job = select! {
            _ = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let chunk_index = job.group.chunk_index;
        let result = match &failure {
            Some(e) => Err(e.clone()),
            None => select! {
                _ = cancel.cancelled() => break,
                r = write_with_retry(index, &blobber, &connection_id, &job, settings, cancel.clone()) => r,
            },
        };
        if let Err(e) = &result {
            failure.get_or_insert_with(|| e.clone());
        }
        if results
            .send(ChunkResult {
                blobber: index,
                chunk_index,
                result,
            })
            .is_err()
        {
            break;
        }
    }
    debug!("Upload worker {} exited", index);
}

impl<'a, B: BlobberApi> Uploader<'a, B> {
    pub fn new(
        allocation: &'a Allocation,
        blobbers: &'a [B],
        core: &'a CoreContext,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            allocation,
            blobbers,
            core,
            cancel,
        }
    }

    fn settings(&self) -> WorkerSettings {
        WorkerSettings {
            rpc_timeout: self.core.config.rpc_timeout,
            chunk_budget: self.core.config.chunk_budget(),
            retry: self.core.config.retry,
        }
    }

    /// Opens one connection per live blobber. Connections are keyed by the
    /// progress id, so a resumed upload gets its old connections back.
    async fn open_connections(&self, progress: &mut UploadProgress, active: &mut [bool]) -> Result<()> {
        let settings = self.settings();
        let opened = join_all(self.blobbers.iter().enumerate().map(|(i, blobber)| {
            let key = progress.progress_id.clone();
            let cancel = self.cancel.clone();
            let live = active[i];
            async move {
                if !live {
                    return (i, Err(Error::transient("blobber dropped from this upload")));
                }
                let key = key.as_str();
                let result = retry(
                    || async move {
                        timeout(settings.rpc_timeout, blobber.new_connection(key)).await?
                    },
                    "open connection",
                    new_backoff(&settings.retry),
                    cancel,
                )
                .await;
                (i, result)
            }
        }))
        .await;
        let mut conflicted = false;
        for (i, result) in opened {
            match result {
                Ok(connection_id) => progress.connection_ids[i] = connection_id,
                Err(e) => {
                    if e.kind() == ErrorKind::Conflict {
                        conflicted = true;
                    }
                    if active[i] {
                        warn!("Blobber {} failed to open a connection: {}", i, e);
                    }
                    active[i] = false;
                }
            }
        }
        if conflicted {
            if let Some(stored) = self.core.progress.load(&progress.progress_id).await? {
                if stored.uploaded_chunks > progress.uploaded_chunks {
                    info!(
                        "Progress {} advanced elsewhere to chunk {}, adopting it",
                        stored.progress_id, stored.uploaded_chunks
                    );
                    *progress = stored;
                }
            }
        }
        let open = active.iter().filter(|a| **a).count();
        if open < self.allocation.write_quorum() {
            return Err(Error::consensus_not_reached(format!(
                "{} connections opened, {} required",
                open,
                self.allocation.write_quorum()
            )));
        }
        Ok(())
    }

    pub async fn stage(&self, request: UploadRequest) -> Result<StagedUpload> {
        let allocation = self.allocation;
        let config = &self.core.config;
        let path = request.remote_path.clone();
        paths::validate(&path)?;
        if path == "/" {
            return Err(Error::invalid_path("cannot upload to the root"));
        }
        let total_shards = allocation.total_shards();
        if self.blobbers.len() != total_shards {
            return Err(Error::invalid_parameter(format!(
                "{} blobber clients for {} shards",
                self.blobbers.len(),
                total_shards
            )));
        }
        let quorum = allocation.write_quorum();
        let params = CodecParams::new(allocation.data_shards, allocation.parity_shards, config.chunk_size)?;
        let (content_hash, source) = fingerprint(request.source, request.actual_size).await?;
        let (cipher, encrypted_key) = if request.encrypt {
            let key = self
                .core
                .encryption_key
                .ok_or_else(|| Error::invalid_parameter("encryption requested without a key"))?;
            (
                Some(ShardCipher::new(&key, &allocation.id, &content_hash, &allocation.blobber_ids())?),
                Some(key_fingerprint(&key, &allocation.id)),
            )
        } else {
            (None, None)
        };
        let codec = Codec::new(params, cipher)?;
        let thumbnail = match &request.thumbnail {
            Some(bytes) => {
                let (meta, shards) =
                    encode_thumbnail(bytes, allocation.data_shards, allocation.parity_shards)?;
                Some((meta, Arc::new(shards)))
            }
            None => None,
        };

        let id = progress_id(&allocation.id, &path, &content_hash);
        let lock = self.core.progress.lock(&id).await?;
        let mut progress = match self.core.progress.load(&id).await? {
            Some(p) if p.is_compatible(params.chunk_size, request.actual_size, total_shards) => {
                info!("Resuming upload of {} at chunk {}", path, p.uploaded_chunks);
                p
            }
            stored => {
                if stored.is_some() {
                    warn!("Discarding incompatible progress for {}", path);
                }
                UploadProgress::new(
                    &allocation.id,
                    &path,
                    &content_hash,
                    params.chunk_size,
                    request.actual_size,
                    total_shards,
                )
            }
        };
        if !self.core.progress.is_durable() {
            debug!("Progress store is not durable, upload of {} cannot resume after exit", path);
        }

        let mut active: Vec<bool> = (0..total_shards)
            .map(|i| !progress.failed_blobbers.contains(&i))
            .collect();
        self.open_connections(&mut progress, &mut active).await?;
        self.core.progress.save(&progress).await?;

        let total_chunks = params.num_chunks(request.actual_size);
        let start_chunk = progress.uploaded_chunks;
        let mut columns: Vec<ColumnHasher> = progress.partial_hash_state.clone();

        info!(
            "Uploading {} ({} bytes, chunks {}..{}) to allocation {}",
            path, request.actual_size, start_chunk, total_chunks, allocation.id
        );
        self.core.events.post(StatusEvent::Started {
            op: OperationKind::Upload,
            allocation_id: allocation.id.clone(),
            path: path.clone(),
            size: request.actual_size,
        });

        let pipeline = self.cancel.child_token();
        let (group_tx, mut group_rx) = mpsc::channel(config.prefetch);
        let producer = spawn_producer(
            codec,
            source,
            request.actual_size,
            start_chunk,
            group_tx,
            pipeline.clone(),
        );
        let (result_tx, mut result_rx) = mpsc::unbounded_channel();
        let mut workers = JoinSet::new();
        let mut job_txs: Vec<Option<mpsc::Sender<ChunkJob>>> = vec![];
        for (i, blobber) in self.blobbers.iter().enumerate() {
            if !active[i] {
                job_txs.push(None);
                continue;
            }
            let (tx, rx) = mpsc::channel(config.prefetch);
            job_txs.push(Some(tx));
            workers.spawn(run_worker(
                i,
                blobber.clone(),
                progress.connection_ids[i].clone(),
                rx,
                result_tx.clone(),
                self.settings(),
                pipeline.clone(),
            ));
        }

        let now = now_unix();
        let mut pending: BTreeMap<u64, PendingChunk> = BTreeMap::new();
        let mut next_ack = start_chunk;
        let mut next_dispatch = start_chunk;
        let mut producer_done = false;
        let outcome: Result<(FileMeta, String, Vec<usize>)> = 'pipeline: loop {
            if producer_done && pending.is_empty() {
                break Err(Error::internal(format!(
                    "source for {} ended before the final chunk",
                    path
                )));
            }
            select! {
                biased;
                _ = self.cancel.cancelled() => break Err(Error::cancelled()),
                Some(result) = result_rx.recv() => {
                    if let Err(e) = &result.result {
                        if active[result.blobber] {
                            warn!("Blobber {} dropped from upload of {}: {}", result.blobber, path, e);
                            active[result.blobber] = false;
                        }
                    }
                    if let Some(chunk) = pending.get_mut(&result.chunk_index) {
                        chunk.results.push((result.blobber, result.result));
                    }
                    while pending
                        .get(&next_ack)
                        .is_some_and(|c| c.results.len() >= c.expected)
                    {
                        let Some(chunk) = pending.remove(&next_ack) else { break };
                        let verdict = match write_consensus(&chunk.results, quorum) {
                            Ok(verdict) => verdict,
                            Err(e) => break 'pipeline Err(e),
                        };
                        progress.uploaded_chunks = next_ack + 1;
                        for i in &verdict.agreeing {
                            progress.blobber_offsets[*i] = next_ack + 1;
                        }
                        for (column, hash) in progress.partial_hash_state.iter_mut().zip(&chunk.hashes) {
                            if let Err(e) = column.push(hash) {
                                break 'pipeline Err(e);
                            }
                        }
                        progress.failed_blobbers = (0..total_shards).filter(|i| !active[*i]).collect();
                        // The final chunk is never recorded; a resume resends it.
                        if chunk.file.is_none() {
                            if let Err(e) = self.core.progress.save(&progress).await {
                                break 'pipeline Err(e);
                            }
                        }
                        debug!("Chunk {} of {} accepted by {:?}", next_ack, path, verdict.agreeing);
                        self.core.events.post(StatusEvent::Progress {
                            op: OperationKind::Upload,
                            allocation_id: allocation.id.clone(),
                            path: path.clone(),
                            completed: ((next_ack + 1) * params.chunk_size as u64).min(request.actual_size),
                            total: request.actual_size,
                        });
                        next_ack += 1;
                        if let Some(file) = chunk.file {
                            break 'pipeline Ok((file, verdict.root, verdict.agreeing));
                        }
                    }
                }
                group = group_rx.recv(), if !producer_done && next_dispatch - next_ack < config.prefetch as u64 => {
                    let group = match group {
                        Some(Ok(group)) => group,
                        Some(Err(e)) => break Err(e),
                        None => {
                            producer_done = true;
                            continue;
                        }
                    };
                    for (column, hash) in columns.iter_mut().zip(&group.shard_hashes) {
                        if let Err(e) = column.push(hash) {
                            break 'pipeline Err(e);
                        }
                    }
                    let file = if group.is_final {
                        let shard_roots: Vec<String> = columns
                            .iter()
                            .map(|c| c.root_hex().unwrap_or_default())
                            .collect();
                        Some(FileMeta {
                            path: path.clone(),
                            name: paths::file_name(&path).to_string(),
                            lookup_hash: lookup_hash(&allocation.id, &path),
                            object_type: ObjectType::File,
                            actual_size: request.actual_size,
                            chunk_size: params.chunk_size as u64,
                            num_chunks: total_chunks,
                            data_shards: allocation.data_shards,
                            parity_shards: allocation.parity_shards,
                            content_hash: content_hash.clone(),
                            validation_root: merkle_root_hex(&shard_roots).unwrap_or_default(),
                            shard_roots,
                            encrypted_key: encrypted_key.clone(),
                            thumbnail: thumbnail.as_ref().map(|(meta, _)| meta.clone()),
                            mime_type: request.mime_type.clone(),
                            created_at: request.created_at.unwrap_or(now),
                            updated_at: now,
                        })
                    } else {
                        None
                    };
                    let meta = Arc::new(UploadMeta {
                        path: path.clone(),
                        operation: request.operation,
                        actual_size: request.actual_size,
                        chunk_index: group.chunk_index,
                        is_final: group.is_final,
                        content_hash: content_hash.clone(),
                        file: file.clone(),
                    });
                    let chunk_index = group.chunk_index;
                    let targets: Vec<usize> = (0..total_shards)
                        .filter(|i| active[*i] && job_txs[*i].is_some())
                        .collect();
                    if targets.len() < quorum {
                        break Err(Error::consensus_not_reached(format!(
                            "{} blobbers left for chunk {}, {} required",
                            targets.len(),
                            chunk_index,
                            quorum
                        )));
                    }
                    pending.insert(chunk_index, PendingChunk {
                        expected: targets.len(),
                        results: vec![],
                        hashes: group.shard_hashes.clone(),
                        file,
                    });
                    let group = Arc::new(group);
                    let thumbnails = if group.is_final {
                        thumbnail.as_ref().map(|(_, shards)| shards.clone())
                    } else {
                        None
                    };
                    for i in targets {
                        let Some(tx) = &job_txs[i] else { continue };
                        let job = ChunkJob {
                            group: group.clone(),
                            meta: meta.clone(),
                            thumbnails: thumbnails.clone(),
                        };
                        if tx.send(job).await.is_err() {
                            job_txs[i] = None;
                            if let Some(chunk) = pending.get_mut(&chunk_index) {
                                chunk.results.push((i, Err(Error::internal("upload worker stopped"))));
                            }
                        }
                    }
                    next_dispatch += 1;
                }
            }
        };

        pipeline.cancel();
        drop(job_txs);
        drop(group_rx);
        while workers.join_next().await.is_some() {}
        if let Err(e) = producer.await {
            warn!("Chunk producer for {} failed: {}", path, e);
        }

        match outcome {
            Ok((file, tree_root, agreeing)) => {
                info!(
                    "Staged {} on {} blobbers, validation root {}",
                    path,
                    agreeing.len(),
                    file.validation_root
                );
                let connections = (0..total_shards)
                    .map(|i| {
                        agreeing
                            .contains(&i)
                            .then(|| progress.connection_ids[i].clone())
                    })
                    .collect();
                Ok(StagedUpload {
                    progress_id: id,
                    file,
                    operation: request.operation,
                    connections,
                    agreeing,
                    tree_root,
                    _lock: lock,
                })
            }
            Err(e) => {
                match e.kind() {
                    ErrorKind::Cancelled => {
                        info!("Upload of {} cancelled at chunk {}", path, progress.uploaded_chunks)
                    }
                    ErrorKind::ConsensusFailed => {
                        warn!("Upload of {} poisoned, abandoning its connections: {}", path, e);
                        self.rollback(&progress.connection_ids).await;
                        self.core.progress.remove(&id).await?;
                    }
                    _ => warn!("Upload of {} failed: {}", path, e),
                }
                Err(e)
            }
        }
    }

    async fn rollback(&self, connection_ids: &[String]) {
        let rollbacks = self
            .blobbers
            .iter()
            .zip(connection_ids)
            .filter(|(_, c)| !c.is_empty())
            .map(|(blobber, connection_id)| async move {
                if let Err(e) = blobber.rollback(connection_id).await {
                    debug!("Rollback on {} failed: {}", blobber.id(), e);
                }
            });
        join_all(rollbacks).await;
    }
}
