//! Download orchestrator: resolves a byte range to windows of blocks,
//! gathers verified shards from the fastest `D` blobbers per window and
//! writes the reconstructed plaintext to the sink in order.

use std::{collections::BTreeMap, sync::Arc};

use rayon::iter::{IntoParallelIterator, ParallelIterator};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    select,
    task::JoinSet,
    time::{Instant, timeout, timeout_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    blobber::{BlobberApi, FileMeta, ReadRequest, ReadTarget, ShardRead},
    cache::BlockKey,
    codec::{Codec, CodecParams, ShardCipher, key_fingerprint, merkle_root_hex},
    consensus::read_consensus,
    context::CoreContext,
    crypto::{hash, hash_hex},
    error::{Error, ErrorKind, Result},
    events::{OperationKind, StatusEvent},
};

/// Inclusive byte range; an open end reads to the end of the object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    /// Clamps the range to an object of `total` bytes. `None` means there
    /// is nothing to read.
    pub fn resolve(&self, total: u64) -> Result<Option<(u64, u64)>> {
        if total == 0 {
            return match (self.start, self.end) {
                (0, None) => Ok(None),
                _ => Err(Error::invalid_parameter("range outside an empty object")),
            };
        }
        if self.start >= total {
            return Err(Error::invalid_parameter(format!(
                "range start {} beyond object size {}",
                self.start, total
            )));
        }
        let end = self.end.unwrap_or(total - 1).min(total - 1);
        if end < self.start {
            return Err(Error::invalid_parameter(format!(
                "range end {} before start {}",
                end, self.start
            )));
        }
        Ok(Some((self.start, end)))
    }

    /// Parses an HTTP `Range` header value. Suffix ranges (`bytes=-n`)
    /// need the object size.
    pub fn parse_header(value: &str, total: u64) -> Result<Self> {
        let spec = value
            .trim()
            .strip_prefix("bytes=")
            .ok_or_else(|| Error::invalid_parameter(format!("unsupported range unit: {}", value)))?;
        if spec.contains(',') {
            return Err(Error::invalid_parameter("multipart ranges are not supported"));
        }
        let (start, end) = spec
            .split_once('-')
            .ok_or_else(|| Error::invalid_parameter(format!("malformed range: {}", value)))?;
        let number = |s: &str| {
            s.trim()
                .parse::<u64>()
                .map_err(|_| Error::invalid_parameter(format!("malformed range: {}", value)))
        };
        match (start.trim().is_empty(), end.trim().is_empty()) {
            (true, true) => Err(Error::invalid_parameter(format!("malformed range: {}", value))),
            (true, false) => {
                let suffix = number(end)?;
                if suffix == 0 {
                    return Err(Error::invalid_parameter("empty suffix range"));
                }
                Ok(Self::new(total.saturating_sub(suffix), None))
            }
            (false, true) => Ok(Self::new(number(start)?, None)),
            (false, false) => Ok(Self::new(number(start)?, Some(number(end)?))),
        }
    }
}

/// Blocks holding bytes `start..=end`.
pub fn block_range(start: u64, end: u64, chunk_size: u64) -> (u64, u64) {
    (start / chunk_size, end / chunk_size)
}

/// Splits `first..=last` into consecutive windows of at most `window`
/// blocks.
pub fn windows(first: u64, last: u64, window: u64) -> Vec<(u64, u64)> {
    let window = window.max(1);
    (first..=last)
        .step_by(window as usize)
        .map(|s| (s, (s + window - 1).min(last)))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadReport {
    /// First byte delivered.
    pub start: u64,
    /// Last byte delivered, inclusive.
    pub end: u64,
    pub total: u64,
    pub bytes_written: u64,
}

impl DownloadReport {
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// Verified shards of one window, keyed by roster index, one entry per
/// block.
struct WindowShards {
    blocks: u64,
    verified: BTreeMap<usize, Vec<Vec<u8>>>,
    failures: Vec<(usize, Error)>,
}

pub struct Downloader<'a, B> {
    allocation_id: String,
    blobbers: &'a [B],
    core: &'a CoreContext,
    file: FileMeta,
    target: ReadTarget,
    codec: Codec,
    cancel: CancellationToken,
}

impl<'a, B: BlobberApi> Downloader<'a, B> {
    /// Checks the object's column roots against its validation root and
    /// prepares the codec. Encrypted objects need the key they were
    /// written with.
    pub fn new(
        allocation_id: &str,
        blobbers: &'a [B],
        core: &'a CoreContext,
        file: FileMeta,
        target: ReadTarget,
        cancel: CancellationToken,
    ) -> Result<Self> {
        if file.is_dir() {
            return Err(Error::invalid_parameter(format!("{} is a directory", file.path)));
        }
        if file.shard_roots.len() != blobbers.len() {
            return Err(Error::corrupted_shards(format!(
                "{} lists {} column roots for {} blobbers",
                file.path,
                file.shard_roots.len(),
                blobbers.len()
            )));
        }
        if merkle_root_hex(&file.shard_roots).as_deref() != Some(file.validation_root.as_str()) {
            return Err(Error::corrupted_shards(format!(
                "column roots of {} do not match validation root {}",
                file.path, file.validation_root
            )));
        }
        let cipher = match &file.encrypted_key {
            Some(fingerprint) => {
                let key = core.encryption_key.ok_or_else(|| {
                    Error::invalid_parameter(format!("{} is encrypted and no key is configured", file.path))
                })?;
                if &key_fingerprint(&key, allocation_id) != fingerprint {
                    return Err(Error::invalid_parameter(format!(
                        "{} was encrypted with a different key",
                        file.path
                    )));
                }
                let ids: Vec<String> = blobbers.iter().map(|b| b.id().to_string()).collect();
                Some(ShardCipher::new(&key, allocation_id, &file.content_hash, &ids)?)
            }
            None => None,
        };
        let params = CodecParams::new(file.data_shards, file.parity_shards, file.chunk_size as usize)?;
        Ok(Self {
            allocation_id: allocation_id.to_string(),
            blobbers,
            core,
            codec: Codec::new(params, cipher)?,
            file,
            target,
            cancel,
        })
    }

    pub fn file(&self) -> &FileMeta {
        &self.file
    }

    /// Streams `range` into `sink`. With `aligned` set, the delivered range
    /// is widened to whole blocks and capped at one window, which is what
    /// the HTTP range front-end serves.
    pub async fn download<W>(&self, range: ByteRange, aligned: bool, sink: &mut W) -> Result<DownloadReport>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let config = &self.core.config;
        let total = self.file.actual_size;
        let chunk_size = self.file.chunk_size;
        let window = config.window_blocks as u64;
        let Some((mut start, mut end)) = range.resolve(total)? else {
            sink.flush().await?;
            return Ok(DownloadReport {
                start: 0,
                end: 0,
                total: 0,
                bytes_written: 0,
            });
        };
        let (first, mut last) = block_range(start, end, chunk_size);
        if aligned {
            last = last.min(first + window - 1);
            start = first * chunk_size;
            end = ((last + 1) * chunk_size).min(total) - 1;
        }
        debug!(
            "Downloading {} bytes {}-{} (blocks {}..={})",
            self.file.path, start, end, first, last
        );
        self.core.events.post(StatusEvent::Started {
            op: OperationKind::Download,
            allocation_id: self.allocation_id.clone(),
            path: self.file.path.clone(),
            size: end - start + 1,
        });

        let mut written = 0u64;
        // Cached windows are held back until a window read from the
        // blobbers reaches quorum, so a quorum loss leaves the sink empty.
        let mut held: Vec<(u64, Arc<Vec<u8>>)> = vec![];
        let mut confirmed = false;
        for (s, e) in windows(first, last, window) {
            if self.cancel.is_cancelled() {
                return Err(Error::cancelled());
            }
            let key = BlockKey {
                lookup_hash: self.file.lookup_hash.clone(),
                version: self.file.validation_root.clone(),
                start_block: s,
                end_block: e,
                window,
            };
            if !confirmed {
                if let Some(hit) = self.core.cache.get(&key) {
                    debug!("Holding cached window {}..={} of {}", s, e, self.file.path);
                    held.push((s, hit));
                    continue;
                }
            }
            let bytes = self
                .core
                .cache
                .get_or_fetch(key, || self.fetch_window(s, e))
                .await?;
            confirmed = true;
            held.push((s, bytes));
            for (s, bytes) in held.drain(..) {
                written += self.emit(sink, s * chunk_size, &bytes, start, end).await?;
                self.post_progress(written, end - start + 1);
            }
        }
        for (s, bytes) in held.drain(..) {
            written += self.emit(sink, s * chunk_size, &bytes, start, end).await?;
            self.post_progress(written, end - start + 1);
        }
        sink.flush().await?;
        Ok(DownloadReport {
            start,
            end,
            total,
            bytes_written: written,
        })
    }

    /// Writes the part of a window starting at byte `window_start` that
    /// falls inside `start..=end`.
    async fn emit<W>(&self, sink: &mut W, window_start: u64, bytes: &[u8], start: u64, end: u64) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let lo = start.saturating_sub(window_start) as usize;
        let hi = ((end + 1 - window_start) as usize).min(bytes.len());
        if lo >= hi {
            return Ok(0);
        }
        sink.write_all(&bytes[lo..hi]).await?;
        Ok((hi - lo) as u64)
    }

    fn post_progress(&self, completed: u64, total: u64) {
        self.core.events.post(StatusEvent::Progress {
            op: OperationKind::Download,
            allocation_id: self.allocation_id.clone(),
            path: self.file.path.clone(),
            completed,
            total,
        });
    }

    /// Plaintext of blocks `s..=e`, with the last block trimmed to the
    /// object size.
    async fn fetch_window(&self, s: u64, e: u64) -> Result<Vec<u8>> {
        let mut shards = WindowShards {
            blocks: e - s + 1,
            verified: BTreeMap::new(),
            failures: vec![],
        };
        for round in 0..2 {
            self.gather(s, &mut shards).await?;
            if shards.verified.len() >= self.file.data_shards {
                break;
            }
            if round == 0 {
                debug!(
                    "Window {}..={} of {}: {} shards verified, retrying stragglers",
                    s,
                    e,
                    self.file.path,
                    shards.verified.len()
                );
            }
        }
        if let Err(e) = read_consensus(shards.verified.len(), self.file.data_shards) {
            for (i, failure) in &shards.failures {
                debug!("Blobber {} failed window {}: {}", i, s, failure);
            }
            warn!("Window {} of {} unavailable: {}", s, self.file.path, e);
            return Err(e);
        }

        let codec = self.codec.clone();
        let params = codec.params();
        let actual_size = self.file.actual_size;
        let verified = shards.verified;
        let blocks = shards.blocks;
        tokio::task::spawn_blocking(move || {
            let decoded = (0..blocks)
                .into_par_iter()
                .map(|j| {
                    let available: BTreeMap<usize, Vec<u8>> = verified
                        .iter()
                        .map(|(i, column)| (*i, column[j as usize].clone()))
                        .collect();
                    codec.decode_chunk(s + j, &available, params.plaintext_len(actual_size, s + j))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(decoded.concat())
        })
        .await?
    }

    /// One fan-out round to every blobber that has not verified yet. Stops
    /// once `D` columns verified or the window deadline fires; surplus
    /// fetches are aborted.
    async fn gather(&self, s: u64, shards: &mut WindowShards) -> Result<()> {
        let rpc_timeout = self.core.config.rpc_timeout;
        let deadline = Instant::now() + self.core.config.window_deadline();
        let mut set = JoinSet::new();
        shards.failures.clear();
        for (i, blobber) in self.blobbers.iter().enumerate() {
            if shards.verified.contains_key(&i) {
                continue;
            }
            let request = ReadRequest {
                target: self.target.clone(),
                start_block: s,
                num_blocks: shards.blocks,
                thumbnail: false,
            };
            let blobber = blobber.clone();
            set.spawn(async move { (i, timeout(rpc_timeout, blobber.read_shard(request)).await) });
        }
        while shards.verified.len() < self.file.data_shards {
            let joined = select! {
                _ = self.cancel.cancelled() => return Err(Error::cancelled()),
                joined = timeout_at(deadline, set.join_next()) => joined,
            };
            let (i, answer) = match joined {
                Ok(Some(Ok(answer))) => answer,
                Ok(Some(Err(e))) => {
                    debug!("Shard fetch task failed: {}", e);
                    continue;
                }
                Ok(None) => break,
                Err(_) => {
                    debug!("Window {} of {} hit its deadline", s, self.file.path);
                    break;
                }
            };
            let verdict = answer
                .map_err(Error::from)
                .and_then(|r| r)
                .and_then(|read| self.verify(i, s, shards.blocks, read));
            match verdict {
                Ok(column) => {
                    shards.verified.insert(i, column);
                }
                Err(e) => shards.failures.push((i, e)),
            }
        }
        set.abort_all();
        Ok(())
    }

    /// Splits a blobber's answer into per-block shards, checking each one
    /// against the blobber's column root.
    fn verify(&self, i: usize, s: u64, blocks: u64, read: ShardRead) -> Result<Vec<Vec<u8>>> {
        let shard_size = self.file.stored_shard_size() as usize;
        if read.data.len() != shard_size * blocks as usize || read.proofs.len() != blocks as usize {
            return Err(Error::corrupted_shards(format!(
                "blobber {} returned {} bytes and {} proofs for {} blocks",
                i,
                read.data.len(),
                read.proofs.len(),
                blocks
            )));
        }
        let root = &self.file.shard_roots[i];
        read.data
            .chunks(shard_size)
            .zip(&read.proofs)
            .enumerate()
            .map(|(j, (shard, proof))| {
                let block = s + j as u64;
                if proof.leaf_index as u64 != block || !proof.verify(&hash(shard), root) {
                    return Err(Error::corrupted_shards(format!(
                        "blobber {} shard of block {} fails its proof",
                        i, block
                    )));
                }
                Ok(shard.to_vec())
            })
            .collect()
    }

    /// Reconstructs the object's thumbnail from any `D` blobbers whose
    /// thumbnail shard matches its published hash.
    pub async fn thumbnail(&self) -> Result<Vec<u8>> {
        let meta = self
            .file
            .thumbnail
            .clone()
            .ok_or_else(|| Error::file_not_found(format!("thumbnail of {}", self.file.path)))?;
        let rpc_timeout = self.core.config.rpc_timeout;
        let mut set = JoinSet::new();
        for (i, blobber) in self.blobbers.iter().enumerate() {
            let request = ReadRequest {
                target: self.target.clone(),
                start_block: 0,
                num_blocks: 1,
                thumbnail: true,
            };
            let blobber = blobber.clone();
            set.spawn(async move { (i, timeout(rpc_timeout, blobber.read_shard(request)).await) });
        }
        let mut verified = BTreeMap::new();
        while verified.len() < self.file.data_shards {
            let joined = select! {
                _ = self.cancel.cancelled() => return Err(Error::cancelled()),
                joined = set.join_next() => joined,
            };
            let Some(joined) = joined else { break };
            let Ok((i, answer)) = joined else { continue };
            match answer.map_err(Error::from).and_then(|r| r) {
                Ok(read) if meta.shard_hashes.get(i) == Some(&hash_hex(&read.data)) => {
                    verified.insert(i, read.data);
                }
                Ok(_) => debug!("Blobber {} returned a mismatching thumbnail shard", i),
                Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                Err(e) => debug!("Blobber {} thumbnail fetch failed: {}", i, e),
            }
        }
        set.abort_all();
        read_consensus(verified.len(), self.file.data_shards)?;
        let params = CodecParams::new(
            self.file.data_shards,
            self.file.parity_shards,
            (meta.size as usize).max(1),
        )?;
        let thumbnail = Codec::new(params, None)?.decode_chunk(0, &verified, meta.size as usize)?;
        info!("Fetched thumbnail of {} ({} bytes)", self.file.path, thumbnail.len());
        Ok(thumbnail)
    }
}
