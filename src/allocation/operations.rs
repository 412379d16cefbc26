use std::path::Path;

use bon::Builder;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWrite, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::AllocationContext;
use crate::{
    blobber::{BlobberApi, FileMeta, ReadTarget, StagedChange},
    chain::ChainFacade,
    consensus::ack_consensus,
    download::{ByteRange, DownloadReport, Downloader},
    error::{Error, ErrorEnvelope, ErrorKind, Result},
    events::{OperationKind, StatusEvent},
    fs::{FileHandle, HandleWriter, OpenMode},
    marker::{AuthTicket, ChangeRecord, FileOp, ReferenceType, now_unix},
    paths,
    retry::{new_backoff, retry},
    upload::{UploadRequest, Uploader},
};

/// Metadata-only operation of a batch. Every one of them is staged on the
/// same connection and committed with one write marker per blobber.
pub type MultiOperation = StagedChange;

#[derive(Debug, Clone, Builder)]
pub struct UploadOptions {
    /// Replace an existing object instead of creating a new one.
    #[builder(default)]
    pub update: bool,
    #[builder(default)]
    pub encrypt: bool,
    #[builder(default = "application/octet-stream".to_string(), into)]
    pub mime_type: String,
    pub thumbnail: Option<Vec<u8>>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, Copy, Default, Builder)]
pub struct DownloadOptions {
    #[builder(default)]
    pub range: ByteRange,
    /// Deliver whole blocks, at most one window.
    #[builder(default)]
    pub aligned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub tx_hash: String,
    pub paths: Vec<String>,
    /// Blobbers whose write marker made it into the commit.
    pub committed_blobbers: Vec<String>,
}

/// One blobber's view of an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStats {
    pub blobber_id: String,
    pub meta: Option<FileMeta>,
    pub error: Option<ErrorEnvelope>,
    pub in_consensus: bool,
}

fn operation_kind(op: FileOp) -> OperationKind {
    match op {
        FileOp::Upload | FileOp::Update => OperationKind::Upload,
        FileOp::Delete => OperationKind::Delete,
        FileOp::Rename => OperationKind::Rename,
        FileOp::Copy => OperationKind::Copy,
        FileOp::Move => OperationKind::Move,
        FileOp::CreateDir => OperationKind::CreateDir,
    }
}

/// Local checks that need no blobber.
fn validate_operation(op: &MultiOperation) -> Result<()> {
    paths::validate(op.path())?;
    if op.path() == "/" {
        return Err(Error::invalid_path(format!("cannot {} the root", op.operation())));
    }
    match op {
        StagedChange::Rename { new_name, .. } => paths::validate_name(new_name),
        StagedChange::Copy { path, dest_dir } | StagedChange::Move { path, dest_dir } => {
            paths::validate(dest_dir)?;
            if paths::is_within(dest_dir, path) {
                return Err(Error::invalid_parameter(format!(
                    "cannot place {} inside itself",
                    path
                )));
            }
            if paths::parent(path) == dest_dir.as_str() {
                return Err(Error::invalid_parameter(format!(
                    "{} already lives in {}",
                    path, dest_dir
                )));
            }
            Ok(())
        }
        StagedChange::Delete { .. } | StagedChange::CreateDir { .. } => Ok(()),
    }
}

impl<B: BlobberApi, C: ChainFacade> AllocationContext<B, C> {
    fn post_outcome<T>(&self, op: OperationKind, allocation_id: &str, path: &str, size: u64, outcome: &Result<T>) {
        let event = match outcome {
            Ok(_) => StatusEvent::Completed {
                op,
                allocation_id: allocation_id.to_string(),
                path: path.to_string(),
                size,
            },
            Err(e) => StatusEvent::Error {
                op,
                allocation_id: allocation_id.to_string(),
                path: path.to_string(),
                error: e.envelope(),
            },
        };
        self.core.events.post(event);
    }

    /// Uploads `source` to `remote_path` and commits it.
    pub async fn upload(
        &self,
        source: Box<dyn FileHandle>,
        actual_size: u64,
        remote_path: &str,
        options: UploadOptions,
        cancel: CancellationToken,
    ) -> Result<OperationResult> {
        let allocation_id = self.id().await;
        let outcome = self
            .upload_inner(source, actual_size, remote_path, options, &cancel)
            .await;
        self.post_outcome(OperationKind::Upload, &allocation_id, remote_path, actual_size, &outcome);
        outcome
    }

    async fn upload_inner(
        &self,
        source: Box<dyn FileHandle>,
        actual_size: u64,
        remote_path: &str,
        options: UploadOptions,
        cancel: &CancellationToken,
    ) -> Result<OperationResult> {
        paths::validate(remote_path)?;
        let operation = if options.update { FileOp::Update } else { FileOp::Upload };
        self.check_write(operation).await?;
        let existing = match self.stat_consensus(ReadTarget::path(remote_path)).await {
            Ok((meta, _)) => Some(meta),
            Err(e) if e.kind() == ErrorKind::FileNotFound => None,
            Err(e) => return Err(e),
        };
        let created_at = match (&existing, options.update) {
            (Some(meta), _) if meta.is_dir() => {
                return Err(Error::invalid_path(format!("{} is a directory", remote_path)));
            }
            (Some(_), false) => {
                return Err(Error::invalid_parameter(format!(
                    "{} already exists, update it instead",
                    remote_path
                )));
            }
            (None, true) => return Err(Error::file_not_found(remote_path)),
            (Some(meta), true) => Some(meta.created_at),
            (None, false) => None,
        };

        let allocation = self.allocation().await;
        let staged = Uploader::new(&allocation, &self.blobbers, &self.core, cancel.clone())
            .stage(UploadRequest {
                remote_path: remote_path.to_string(),
                operation,
                source,
                actual_size,
                mime_type: options.mime_type,
                thumbnail: options.thumbnail,
                encrypt: options.encrypt,
                created_at,
            })
            .await?;
        let changes: Vec<Vec<ChangeRecord>> = (0..self.blobbers.len())
            .map(|i| vec![staged.change_for(i)])
            .collect();
        let committed = self
            .commit_changes(
                &staged.connections,
                &changes,
                &operation.to_string(),
                allocation.write_quorum(),
                &[remote_path.to_string()],
                cancel,
            )
            .await;
        // Committed or rolled back, the connections are spent either way.
        self.core.progress.remove(&staged.progress_id).await?;
        let committed = committed?;
        info!(
            "Uploaded {} ({} bytes) to {}",
            remote_path, actual_size, allocation.id
        );
        Ok(OperationResult {
            tx_hash: committed.tx_hash,
            paths: vec![remote_path.to_string()],
            committed_blobbers: committed.markers.into_iter().map(|m| m.blobber_id).collect(),
        })
    }

    /// Uploads a local file through the platform file system.
    pub async fn upload_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        options: UploadOptions,
        cancel: CancellationToken,
    ) -> Result<OperationResult> {
        let size = self.core.fs.size(local_path)?;
        let source = self.core.fs.open(local_path, OpenMode::Read)?;
        self.upload(source, size, remote_path, options, cancel).await
    }

    pub async fn download<W>(
        &self,
        remote_path: &str,
        sink: &mut W,
        options: DownloadOptions,
        cancel: CancellationToken,
    ) -> Result<DownloadReport>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let allocation_id = self.id().await;
        let outcome = async {
            let file = self.stat(remote_path).await?;
            Downloader::new(
                &allocation_id,
                &self.blobbers,
                &self.core,
                file,
                ReadTarget::path(remote_path),
                cancel,
            )?
            .download(options.range, options.aligned, sink)
            .await
        }
        .await;
        let size = outcome.as_ref().map(|r| r.bytes_written).unwrap_or(0);
        self.post_outcome(OperationKind::Download, &allocation_id, remote_path, size, &outcome);
        outcome
    }

    /// Downloads into a local file through the platform file system.
    pub async fn download_to_file(
        &self,
        remote_path: &str,
        local_path: &Path,
        options: DownloadOptions,
        cancel: CancellationToken,
    ) -> Result<DownloadReport> {
        let handle = self.core.fs.open(local_path, OpenMode::Create)?;
        let mut sink = HandleWriter::new(handle);
        self.download(remote_path, &mut sink, options, cancel).await
    }

    pub async fn thumbnail(&self, remote_path: &str, cancel: CancellationToken) -> Result<Vec<u8>> {
        let allocation_id = self.id().await;
        let file = self.stat(remote_path).await?;
        Downloader::new(
            &allocation_id,
            &self.blobbers,
            &self.core,
            file,
            ReadTarget::path(remote_path),
            cancel,
        )?
        .thumbnail()
        .await
    }

    /// Issues an auth ticket for `remote_path`. `referee` binds the ticket
    /// to one client; `expiration` is unix seconds, zero for none.
    pub async fn share(
        &self,
        remote_path: &str,
        referee: Option<&str>,
        expiration: i64,
        encryption_public_key: Option<String>,
    ) -> Result<String> {
        let allocation = self.allocation().await;
        if self.core.client_id() != allocation.owner_id {
            return Err(Error::new(
                ErrorKind::Unauthorized,
                "only the allocation owner can share objects",
            ));
        }
        if expiration != 0 && expiration <= now_unix() {
            return Err(Error::invalid_parameter("ticket expiration is in the past"));
        }
        let meta = self.stat(remote_path).await?;
        let ticket = AuthTicket {
            client_id: referee.unwrap_or_default().to_string(),
            owner_id: allocation.owner_id.clone(),
            allocation_id: allocation.id.clone(),
            file_path_hash: meta.lookup_hash.clone(),
            actual_file_hash: meta.content_hash.clone(),
            file_name: meta.name.clone(),
            reference_type: if meta.is_dir() {
                ReferenceType::Directory
            } else {
                ReferenceType::File
            },
            expiration,
            encryption_public_key,
            signature: String::new(),
        }
        .sign(&self.core.credentials)?;
        debug!("Shared {} of {} until {}", remote_path, allocation.id, expiration);
        ticket.encode()
    }

    /// Downloads with an auth ticket instead of owner credentials. For a
    /// shared directory `path` names the object inside it.
    pub async fn download_shared<W>(
        &self,
        ticket: &str,
        path: Option<String>,
        sink: &mut W,
        options: DownloadOptions,
        cancel: CancellationToken,
    ) -> Result<DownloadReport>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let allocation = self.allocation().await;
        let decoded = AuthTicket::decode(ticket)?;
        decoded.check(now_unix(), Some(self.core.client_id()))?;
        if decoded.allocation_id != allocation.id {
            return Err(Error::auth_ticket(format!(
                "ticket is for allocation {}",
                decoded.allocation_id
            )));
        }
        if !decoded.verify(&self.core.credentials, &allocation.owner_public_key)? {
            return Err(Error::auth_ticket("ticket signature does not verify"));
        }
        if decoded.reference_type == ReferenceType::File && path.is_some() {
            return Err(Error::invalid_parameter("a file ticket takes no sub-path"));
        }
        self.check_read().await?;
        let target = ReadTarget::Ticket {
            ticket: ticket.to_string(),
            path,
        };
        let (file, _) = self.stat_consensus(target.clone()).await?;
        let label = file.path.clone();
        let outcome = async {
            Downloader::new(&allocation.id, &self.blobbers, &self.core, file, target, cancel)?
                .download(options.range, options.aligned, sink)
                .await
        }
        .await;
        let size = outcome.as_ref().map(|r| r.bytes_written).unwrap_or(0);
        self.post_outcome(OperationKind::Download, &allocation.id, &label, size, &outcome);
        outcome
    }

    pub async fn delete(&self, path: &str, cancel: CancellationToken) -> Result<OperationResult> {
        self.do_multi_operation(
            vec![StagedChange::Delete {
                path: path.to_string(),
            }],
            cancel,
        )
        .await
    }

    pub async fn rename(&self, path: &str, new_name: &str, cancel: CancellationToken) -> Result<OperationResult> {
        self.do_multi_operation(
            vec![StagedChange::Rename {
                path: path.to_string(),
                new_name: new_name.to_string(),
            }],
            cancel,
        )
        .await
    }

    pub async fn copy(&self, path: &str, dest_dir: &str, cancel: CancellationToken) -> Result<OperationResult> {
        self.do_multi_operation(
            vec![StagedChange::Copy {
                path: path.to_string(),
                dest_dir: dest_dir.to_string(),
            }],
            cancel,
        )
        .await
    }

    pub async fn move_object(&self, path: &str, dest_dir: &str, cancel: CancellationToken) -> Result<OperationResult> {
        self.do_multi_operation(
            vec![StagedChange::Move {
                path: path.to_string(),
                dest_dir: dest_dir.to_string(),
            }],
            cancel,
        )
        .await
    }

    pub async fn create_dir(&self, path: &str, cancel: CancellationToken) -> Result<OperationResult> {
        self.do_multi_operation(
            vec![StagedChange::CreateDir {
                path: path.to_string(),
            }],
            cancel,
        )
        .await
    }

    /// Stages `ops` in order on one connection per blobber and commits them
    /// together. The first operation without quorum aborts the batch and
    /// rolls back every connection.
    pub async fn do_multi_operation(
        &self,
        ops: Vec<MultiOperation>,
        cancel: CancellationToken,
    ) -> Result<OperationResult> {
        let allocation_id = self.id().await;
        let (kind, label) = match ops.as_slice() {
            [single] => (operation_kind(single.operation()), single.path().to_string()),
            _ => (OperationKind::MultiOperation, format!("{} operations", ops.len())),
        };
        self.core.events.post(StatusEvent::Started {
            op: kind,
            allocation_id: allocation_id.clone(),
            path: label.clone(),
            size: 0,
        });
        let outcome = self.multi_operation_inner(&ops, &cancel).await;
        self.post_outcome(kind, &allocation_id, &label, 0, &outcome);
        outcome
    }

    async fn multi_operation_inner(
        &self,
        ops: &[MultiOperation],
        cancel: &CancellationToken,
    ) -> Result<OperationResult> {
        if ops.is_empty() {
            return Err(Error::invalid_parameter("no operations given"));
        }
        for op in ops {
            validate_operation(op)?;
            self.check_write(op.operation()).await?;
        }
        let allocation = self.allocation().await;
        let quorum = allocation.write_quorum();
        let key = Uuid::new_v4().simple().to_string();
        let mut connections = self.open_connections(&key, cancel).await;
        let open = connections.iter().filter(|c| c.is_some()).count();
        if open < quorum {
            self.rollback(&connections).await;
            return Err(Error::consensus_not_reached(format!(
                "{} connections opened, {} required",
                open, quorum
            )));
        }

        let rpc_timeout = self.core.config.rpc_timeout;
        let policy = self.core.config.retry;
        let mut changes: Vec<Vec<ChangeRecord>> = vec![vec![]; self.blobbers.len()];
        for op in ops {
            if cancel.is_cancelled() {
                self.rollback(&connections).await;
                return Err(Error::cancelled());
            }
            let staged: Vec<(usize, Result<()>)> = join_all(
                self.blobbers
                    .iter()
                    .zip(&connections)
                    .enumerate()
                    .filter_map(|(i, (blobber, c))| Some((i, blobber, c.as_deref()?)))
                    .map(|(i, blobber, connection_id)| {
                        let cancel = cancel.clone();
                        async move {
                            let result = retry(
                                || async move {
                                    timeout(rpc_timeout, blobber.stage(connection_id, op.clone())).await?
                                },
                                "stage change",
                                new_backoff(&policy),
                                cancel,
                            )
                            .await;
                            (i, result)
                        }
                    }),
            )
            .await;
            let agreeing = match ack_consensus(&staged, quorum) {
                Ok(agreeing) => agreeing,
                Err(e) => {
                    let missing = staged
                        .iter()
                        .filter(|(_, r)| matches!(r, Err(e) if e.kind() == ErrorKind::FileNotFound))
                        .count();
                    self.rollback(&connections).await;
                    if missing >= allocation.read_quorum() && e.kind() != ErrorKind::ConsensusFailed {
                        return Err(Error::file_not_found(op.path()));
                    }
                    return Err(e);
                }
            };
            let dropped: Vec<Option<String>> = connections
                .iter_mut()
                .enumerate()
                .map(|(i, c)| if agreeing.contains(&i) { None } else { c.take() })
                .collect();
            self.rollback(&dropped).await;
            for i in &agreeing {
                changes[*i].push(ChangeRecord {
                    operation: op.operation(),
                    path: op.path().to_string(),
                    dest_path: op.dest_path(),
                    size: 0,
                    content_root: String::new(),
                });
            }
        }

        let mut changed: Vec<String> = vec![];
        for op in ops {
            changed.push(op.path().to_string());
            changed.extend(op.dest_path());
        }
        let label = match ops {
            [single] => single.operation().to_string(),
            _ => "multi_operation".to_string(),
        };
        let committed = self
            .commit_changes(&connections, &changes, &label, quorum, &changed, cancel)
            .await?;
        Ok(OperationResult {
            tx_hash: committed.tx_hash,
            paths: changed,
            committed_blobbers: committed.markers.into_iter().map(|m| m.blobber_id).collect(),
        })
    }

    /// Every blobber's metadata for `path`, flagged against the consensus
    /// view.
    pub async fn file_stats(&self, path: &str) -> Result<Vec<FileStats>> {
        paths::validate(path)?;
        self.check_read().await?;
        let results = self.stat_all(&ReadTarget::path(path)).await;
        let data_shards = self.allocation.read().await.data_shards;
        let agreed = crate::consensus::meta_consensus(&results, data_shards)
            .ok()
            .map(|(_, agreeing)| agreeing)
            .unwrap_or_default();
        Ok(results
            .into_iter()
            .map(|(i, result)| {
                let blobber_id = self.blobbers[i].id().to_string();
                match result {
                    Ok(meta) => FileStats {
                        blobber_id,
                        meta: Some(meta),
                        error: None,
                        in_consensus: agreed.contains(&i),
                    },
                    Err(e) => FileStats {
                        blobber_id,
                        meta: None,
                        error: Some(e.envelope()),
                        in_consensus: false,
                    },
                }
            })
            .collect())
    }
}
