use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::AllocationContext;
use crate::{
    blobber::{BlobberApi, FileMeta, ReadTarget, UploadMeta, WriteChunkRequest},
    chain::ChainFacade,
    codec::{Codec, CodecParams, ShardCipher},
    download::{ByteRange, Downloader},
    error::{Error, ErrorEnvelope, ErrorKind, Result},
    events::StatusEvent,
    marker::{ChangeRecord, FileOp},
    retry::{new_backoff, retry},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    pub files_checked: u64,
    pub files_repaired: u64,
    pub repaired: Vec<String>,
    pub failed: Vec<(String, ErrorEnvelope)>,
}

impl<B: BlobberApi, C: ChainFacade> AllocationContext<B, C> {
    /// Walks `path` and re-uploads every file to the blobbers whose copy is
    /// missing or differs from the consensus view. Healthy blobbers are
    /// never written to.
    pub async fn repair(&self, path: &str, cancel: CancellationToken) -> Result<RepairReport> {
        self.check_write(FileOp::Update).await?;
        let allocation_id = self.id().await;
        let mut report = RepairReport::default();
        let mut pending = vec![path.to_string()];
        while let Some(next) = pending.pop() {
            if cancel.is_cancelled() {
                return Err(Error::cancelled());
            }
            let meta = self.stat(&next).await?;
            if meta.is_dir() {
                let children = self.list(&next).await?;
                pending.extend(children.into_iter().map(|c| c.path).rev());
                continue;
            }
            report.files_checked += 1;
            match self.repair_file(&meta, &cancel).await {
                Ok(true) => {
                    report.files_repaired += 1;
                    report.repaired.push(meta.path.clone());
                }
                Ok(false) => {}
                Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                Err(e) => {
                    warn!("Repair of {} failed: {}", meta.path, e);
                    report.failed.push((meta.path.clone(), e.envelope()));
                }
            }
        }
        info!(
            "Repair of {} on {}: {} checked, {} repaired, {} failed",
            path,
            allocation_id,
            report.files_checked,
            report.files_repaired,
            report.failed.len()
        );
        self.core.events.post(StatusEvent::RepairCompleted {
            allocation_id,
            files_repaired: report.files_repaired,
        });
        Ok(report)
    }

    /// Returns whether anything had to be written.
    async fn repair_file(&self, meta: &FileMeta, cancel: &CancellationToken) -> Result<bool> {
        let results = self.stat_all(&ReadTarget::path(&meta.path)).await;
        let expected = meta.meta_hash();
        let targets: Vec<(usize, FileOp)> = results
            .iter()
            .filter_map(|(i, result)| match result {
                Ok(found) if found.meta_hash() == expected => None,
                Ok(_) => Some((*i, FileOp::Update)),
                Err(e) if e.kind() == ErrorKind::FileNotFound => Some((*i, FileOp::Upload)),
                Err(_) => None,
            })
            .collect();
        if targets.is_empty() {
            return Ok(false);
        }
        info!(
            "Repairing {} on blobbers {:?}",
            meta.path,
            targets.iter().map(|(i, _)| *i).collect::<Vec<_>>()
        );

        let allocation = self.allocation().await;
        let downloader = Downloader::new(
            &allocation.id,
            &self.blobbers,
            &self.core,
            meta.clone(),
            ReadTarget::path(&meta.path),
            cancel.clone(),
        )?;
        let mut plaintext = Vec::with_capacity(meta.actual_size as usize);
        downloader.download(ByteRange::full(), false, &mut plaintext).await?;
        let thumbnail = match &meta.thumbnail {
            Some(_) => {
                let bytes = downloader.thumbnail().await?;
                let params = CodecParams::new(meta.data_shards, meta.parity_shards, bytes.len().max(1))?;
                Some(Codec::new(params, None)?.encode_chunk(0, &bytes, true)?.shards)
            }
            None => None,
        };

        let cipher = match (&meta.encrypted_key, self.core.encryption_key) {
            (Some(_), Some(key)) => Some(ShardCipher::new(
                &key,
                &allocation.id,
                &meta.content_hash,
                &allocation.blobber_ids(),
            )?),
            (Some(_), None) => {
                return Err(Error::invalid_parameter(format!(
                    "{} is encrypted and no key is configured",
                    meta.path
                )));
            }
            (None, _) => None,
        };
        let params = CodecParams::new(meta.data_shards, meta.parity_shards, meta.chunk_size as usize)?;
        let codec = Codec::new(params, cipher)?;
        let total_chunks = params.num_chunks(meta.actual_size);

        let key = Uuid::new_v4().simple().to_string();
        let opened = self.open_connections(&key, cancel).await;
        let mut connections: Vec<Option<String>> = vec![None; self.blobbers.len()];
        for (i, _) in &targets {
            connections[*i] = opened[*i].clone();
        }
        let unused: Vec<Option<String>> = opened
            .iter()
            .enumerate()
            .map(|(i, c)| if connections[i].is_none() { c.clone() } else { None })
            .collect();
        self.rollback(&unused).await;
        if connections.iter().all(Option::is_none) {
            return Err(Error::consensus_not_reached(format!(
                "no blobber out of sync with {} accepted a connection",
                meta.path
            )));
        }

        let rpc_timeout = self.core.config.rpc_timeout;
        let policy = self.core.config.retry;
        for chunk_index in 0..total_chunks {
            if cancel.is_cancelled() {
                self.rollback(&connections).await;
                return Err(Error::cancelled());
            }
            let start = (chunk_index * params.chunk_size as u64) as usize;
            let end = (start + params.plaintext_len(meta.actual_size, chunk_index)).min(plaintext.len());
            let is_final = chunk_index + 1 == total_chunks;
            let group = codec.encode_chunk(chunk_index, &plaintext[start..end], is_final)?;
            let upload_meta = UploadMeta {
                path: meta.path.clone(),
                operation: FileOp::Update,
                actual_size: meta.actual_size,
                chunk_index,
                is_final,
                content_hash: meta.content_hash.clone(),
                file: is_final.then(|| meta.clone()),
            };
            let writes = join_all(
                self.blobbers
                    .iter()
                    .zip(&connections)
                    .enumerate()
                    .filter_map(|(i, (blobber, c))| Some((i, blobber, c.as_deref()?)))
                    .map(|(i, blobber, connection_id)| {
                        let request = WriteChunkRequest {
                            connection_id: connection_id.to_string(),
                            meta: upload_meta.clone(),
                            shard: group.shards[i].clone(),
                            shard_hash: group.shard_hashes[i].clone(),
                            thumbnail: if is_final {
                                thumbnail.as_ref().map(|t| t[i].clone())
                            } else {
                                None
                            },
                        };
                        let cancel = cancel.clone();
                        async move {
                            let request = &request;
                            let written = retry(
                                || async move {
                                    timeout(rpc_timeout, blobber.write_chunk(request.clone())).await?
                                },
                                "repair chunk",
                                new_backoff(&policy),
                                cancel,
                            )
                            .await;
                            (i, written)
                        }
                    }),
            )
            .await;
            for (i, written) in writes {
                let failure = match written {
                    Ok(response) if response.accepted => continue,
                    Ok(_) => Error::new(ErrorKind::Conflict, "chunk refused"),
                    Err(e) => e,
                };
                warn!("Blobber {} failed repair of {}: {}", i, meta.path, failure);
                self.rollback(&connections).await;
                return Err(failure);
            }
        }

        let changes: Vec<Vec<ChangeRecord>> = (0..self.blobbers.len())
            .map(|i| {
                let operation = targets
                    .iter()
                    .find(|(t, _)| *t == i)
                    .map(|(_, op)| *op)
                    .unwrap_or(FileOp::Update);
                vec![ChangeRecord {
                    operation,
                    path: meta.path.clone(),
                    dest_path: None,
                    size: meta.actual_size as i64,
                    content_root: meta.shard_roots.get(i).cloned().unwrap_or_default(),
                }]
            })
            .collect();
        let writers = connections.iter().filter(|c| c.is_some()).count();
        self.commit_changes(
            &connections,
            &changes,
            "repair",
            writers,
            &[meta.path.clone()],
            cancel,
        )
        .await?;
        Ok(true)
    }
}
