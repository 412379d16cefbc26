use std::{
    collections::HashMap,
    sync::Mutex,
    time::Instant,
};

use futures_util::future::join_all;
use tokio::{sync::RwLock, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Allocation;
use crate::{
    blobber::{BlobberApi, CommitAck, FileMeta, HttpBlobber, ReadTarget},
    chain::ChainFacade,
    commit::CommitBinder,
    consensus::{ack_consensus, list_consensus, meta_consensus},
    context::CoreContext,
    crypto::lookup_hash,
    error::{Error, ErrorKind, Result},
    marker::{ChangeRecord, FileOp, WriteMarker, change_hash, next_allocation_root, now_unix},
    paths,
    retry::{new_backoff, retry},
};

/// Outcome of one committed batch of changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub tx_hash: String,
    pub markers: Vec<WriteMarker>,
}

#[derive(Default)]
struct TreeCache {
    metas: HashMap<String, (Instant, FileMeta)>,
    listings: HashMap<String, (Instant, Vec<FileMeta>)>,
}

impl TreeCache {
    /// Drops everything at or below `path`, plus the listings of its
    /// ancestors.
    fn invalidate(&mut self, path: &str) {
        let ancestors = paths::ancestors(path);
        let stale = |key: &String| paths::is_within(key, path) || ancestors.contains(key);
        self.metas.retain(|k, _| !stale(k));
        self.listings.retain(|k, _| !stale(k));
    }
}

/// One allocation as seen by one client: the chain-issued header, a client
/// per blobber in roster order and the caches shared by every operation on
/// it.
pub struct AllocationContext<B, C> {
    pub(super) allocation: RwLock<Allocation>,
    pub(super) blobbers: Vec<B>,
    pub(super) core: CoreContext,
    chain: C,
    binder: CommitBinder<C>,
    tree: RwLock<TreeCache>,
    /// Latest allocation root of every blobber as far as this client knows.
    roots: Mutex<Vec<Option<String>>>,
}

impl<C: ChainFacade> AllocationContext<HttpBlobber, C> {
    /// Reads the allocation from the chain and connects to its blobbers
    /// over HTTP.
    pub async fn open(
        allocation_id: &str,
        chain: C,
        core: CoreContext,
        storage_sc_address: &str,
    ) -> Result<Self> {
        let allocation = chain.allocation(allocation_id).await?;
        let blobbers = allocation
            .blobbers
            .iter()
            .map(|node| {
                HttpBlobber::new(
                    &node.id,
                    &node.base_url,
                    &allocation.id,
                    core.credentials.clone(),
                    core.config.rpc_timeout,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(allocation, blobbers, core, chain, storage_sc_address)
    }
}

impl<B: BlobberApi, C: ChainFacade> AllocationContext<B, C> {
    pub fn new(
        allocation: Allocation,
        blobbers: Vec<B>,
        core: CoreContext,
        chain: C,
        storage_sc_address: &str,
    ) -> Result<Self> {
        allocation.validate()?;
        if blobbers.len() != allocation.total_shards() {
            return Err(Error::invalid_parameter(format!(
                "{} blobber clients for {} blobbers",
                blobbers.len(),
                allocation.total_shards()
            )));
        }
        for (client, node) in blobbers.iter().zip(&allocation.blobbers) {
            if client.id() != node.id {
                return Err(Error::invalid_parameter(format!(
                    "blobber client {} out of roster order, expected {}",
                    client.id(),
                    node.id
                )));
            }
        }
        let binder = CommitBinder::new(
            chain.clone(),
            core.credentials.clone(),
            storage_sc_address,
            core.config.clone(),
        );
        Ok(Self {
            roots: Mutex::new(vec![None; blobbers.len()]),
            allocation: RwLock::new(allocation),
            blobbers,
            core,
            chain,
            binder,
            tree: RwLock::default(),
        })
    }

    pub async fn allocation(&self) -> Allocation {
        self.allocation.read().await.clone()
    }

    pub async fn id(&self) -> String {
        self.allocation.read().await.id.clone()
    }

    pub fn core(&self) -> &CoreContext {
        &self.core
    }

    pub fn blobbers(&self) -> &[B] {
        &self.blobbers
    }

    pub fn binder(&self) -> &CommitBinder<C> {
        &self.binder
    }

    /// Re-reads the allocation header and every blobber's latest root, and
    /// drops the cached file tree.
    pub async fn refresh(&self) -> Result<()> {
        let id = self.id().await;
        let fresh = self.chain.allocation(&id).await?;
        {
            let mut allocation = self.allocation.write().await;
            allocation.apply_status(fresh.status);
            allocation.expiration = fresh.expiration;
            allocation.file_options = fresh.file_options;
        }
        self.clear_roots();
        self.latest_roots().await;
        *self.tree.write().await = TreeCache::default();
        debug!("Refreshed allocation {}", id);
        Ok(())
    }

    pub(super) async fn check_read(&self) -> Result<()> {
        self.allocation.read().await.check_read(now_unix())
    }

    pub(super) async fn check_write(&self, op: FileOp) -> Result<()> {
        self.allocation
            .read()
            .await
            .check_write(op, self.core.client_id(), now_unix())
    }

    fn clear_roots(&self) {
        if let Ok(mut roots) = self.roots.lock() {
            roots.iter_mut().for_each(|r| *r = None);
        }
    }

    fn cached_roots(&self) -> Vec<Option<String>> {
        self.roots
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|_| vec![None; self.blobbers.len()])
    }

    /// Cached roots, fetching the ones this client does not know yet.
    /// Unreachable blobbers stay `None`.
    pub async fn latest_roots(&self) -> Vec<Option<String>> {
        let cached = self.cached_roots();
        let rpc_timeout = self.core.config.rpc_timeout;
        let fetched = join_all(self.blobbers.iter().zip(cached).map(|(blobber, root)| async move {
            if root.is_some() {
                return root;
            }
            match timeout(rpc_timeout, blobber.latest_root()).await {
                Ok(Ok(info)) => Some(info.allocation_root),
                Ok(Err(e)) => {
                    debug!("Latest root of {} unavailable: {}", blobber.id(), e);
                    None
                }
                Err(_) => None,
            }
        }))
        .await;
        if let Ok(mut roots) = self.roots.lock() {
            for (slot, root) in roots.iter_mut().zip(&fetched) {
                if slot.is_none() {
                    slot.clone_from(root);
                }
            }
        }
        fetched
    }

    pub async fn stat(&self, path: &str) -> Result<FileMeta> {
        paths::validate(path)?;
        self.check_read().await?;
        let ttl = self.core.config.tree_ttl;
        if let Some((at, meta)) = self.tree.read().await.metas.get(path) {
            if at.elapsed() < ttl {
                return Ok(meta.clone());
            }
        }
        let (meta, _) = self.stat_consensus(ReadTarget::path(path)).await?;
        self.tree
            .write()
            .await
            .metas
            .insert(path.to_string(), (Instant::now(), meta.clone()));
        Ok(meta)
    }

    /// Metadata vote across every blobber, bypassing the tree cache.
    pub(super) async fn stat_consensus(&self, target: ReadTarget) -> Result<(FileMeta, Vec<usize>)> {
        let results = self.stat_all(&target).await;
        let data_shards = self.allocation.read().await.data_shards;
        meta_consensus(&results, data_shards)
    }

    pub(super) async fn stat_all(&self, target: &ReadTarget) -> Vec<(usize, Result<FileMeta>)> {
        let rpc_timeout = self.core.config.rpc_timeout;
        join_all(self.blobbers.iter().enumerate().map(|(i, blobber)| {
            let target = target.clone();
            async move { (i, timeout(rpc_timeout, blobber.stat(target)).await.map_err(Error::from).and_then(|r| r)) }
        }))
        .await
    }

    pub async fn list(&self, path: &str) -> Result<Vec<FileMeta>> {
        paths::validate(path)?;
        self.check_read().await?;
        let ttl = self.core.config.tree_ttl;
        if let Some((at, children)) = self.tree.read().await.listings.get(path) {
            if at.elapsed() < ttl {
                return Ok(children.clone());
            }
        }
        let rpc_timeout = self.core.config.rpc_timeout;
        let results = join_all(self.blobbers.iter().enumerate().map(|(i, blobber)| async move {
            let listed = timeout(rpc_timeout, blobber.list(ReadTarget::path(path)))
                .await
                .map_err(Error::from)
                .and_then(|r| r);
            (i, listed)
        }))
        .await;
        let data_shards = self.allocation.read().await.data_shards;
        let (children, _) = list_consensus(&results, data_shards)?;
        self.tree
            .write()
            .await
            .listings
            .insert(path.to_string(), (Instant::now(), children.clone()));
        Ok(children)
    }

    /// Drops cached metadata and plaintext of the given paths.
    pub async fn invalidate(&self, changed: &[String]) {
        let id = self.id().await;
        let mut tree = self.tree.write().await;
        for path in changed {
            tree.invalidate(path);
            self.core.cache.invalidate(&lookup_hash(&id, path));
        }
    }

    /// Opens one connection per blobber under `key`. Blobbers that fail to
    /// answer get `None`.
    pub(super) async fn open_connections(&self, key: &str, cancel: &CancellationToken) -> Vec<Option<String>> {
        let rpc_timeout = self.core.config.rpc_timeout;
        let policy = self.core.config.retry;
        join_all(self.blobbers.iter().map(|blobber| {
            let cancel = cancel.clone();
            async move {
                let opened = retry(
                    || async move { timeout(rpc_timeout, blobber.new_connection(key)).await? },
                    "open connection",
                    new_backoff(&policy),
                    cancel,
                )
                .await;
                match opened {
                    Ok(connection_id) => Some(connection_id),
                    Err(e) => {
                        warn!("Blobber {} refused a connection: {}", blobber.id(), e);
                        None
                    }
                }
            }
        }))
        .await
    }

    pub async fn rollback(&self, connections: &[Option<String>]) {
        let rollbacks = self
            .blobbers
            .iter()
            .zip(connections)
            .filter_map(|(blobber, c)| c.as_deref().map(|c| (blobber, c)))
            .map(|(blobber, connection_id)| async move {
                if let Err(e) = blobber.rollback(connection_id).await {
                    debug!("Rollback of {} on {} failed: {}", connection_id, blobber.id(), e);
                }
            });
        join_all(rollbacks).await;
    }

    /// Signs one write marker per staged blobber, finalizes them and binds
    /// the accepted set on chain. Any failure rolls every connection back;
    /// a disagreement also forgets the cached roots so that the next
    /// operation starts from the blobbers' view.
    pub async fn commit_changes(
        &self,
        connections: &[Option<String>],
        changes: &[Vec<ChangeRecord>],
        operation: &str,
        quorum: usize,
        changed_paths: &[String],
        cancel: &CancellationToken,
    ) -> Result<Committed> {
        let allocation_id = self.id().await;
        let roots = self.latest_roots().await;
        let timestamp = now_unix();
        let mut markers: Vec<Option<WriteMarker>> = vec![None; self.blobbers.len()];
        for (i, blobber) in self.blobbers.iter().enumerate() {
            let (Some(_), Some(prev)) = (&connections[i], &roots[i]) else {
                continue;
            };
            let records = &changes[i];
            let marker = WriteMarker {
                allocation_root: next_allocation_root(prev, &change_hash(records)?, timestamp),
                prev_allocation_root: prev.clone(),
                allocation_id: allocation_id.clone(),
                blobber_id: blobber.id().to_string(),
                client_id: self.core.client_id().to_string(),
                size: records.iter().map(|r| r.size).sum(),
                timestamp,
                operation: operation.to_string(),
                signature: String::new(),
            };
            markers[i] = Some(marker.sign(&self.core.credentials)?);
        }

        let rpc_timeout = self.core.config.rpc_timeout;
        let policy = self.core.config.retry;
        let finalized: Vec<(usize, Result<CommitAck>)> = join_all(
            self.blobbers
                .iter()
                .zip(connections)
                .zip(&markers)
                .enumerate()
                .filter_map(|(i, ((blobber, connection), marker))| {
                    Some((i, blobber, connection.as_deref()?, marker.as_ref()?))
                })
                .map(|(i, blobber, connection_id, marker)| {
                    let cancel = cancel.clone();
                    async move {
                        let acked = retry(
                            || async move {
                                timeout(rpc_timeout, blobber.finalize(connection_id, marker.clone())).await?
                            },
                            "finalize",
                            new_backoff(&policy),
                            cancel,
                        )
                        .await;
                        (i, acked)
                    }
                }),
        )
        .await;

        let agreeing = match ack_consensus(&finalized, quorum) {
            Ok(agreeing) => agreeing,
            Err(e) => {
                if e.kind() == ErrorKind::ConsensusFailed {
                    warn!("Blobbers rejected {} on {}: {}", operation, allocation_id, e);
                    self.clear_roots();
                }
                self.rollback(connections).await;
                return Err(e);
            }
        };
        let accepted: Vec<WriteMarker> = agreeing
            .iter()
            .filter_map(|i| markers[*i].clone())
            .collect();
        let tx_hash = match self.binder.commit(&allocation_id, &accepted, cancel.clone()).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!("Chain commit of {} on {} failed, rolling back: {}", operation, allocation_id, e);
                self.rollback(connections).await;
                self.clear_roots();
                return Err(e);
            }
        };
        if let Ok(mut cached) = self.roots.lock() {
            for (i, slot) in cached.iter_mut().enumerate() {
                *slot = if agreeing.contains(&i) {
                    markers[i].as_ref().map(|m| m.allocation_root.clone())
                } else {
                    None
                };
            }
        }
        self.invalidate(changed_paths).await;
        info!(
            "Committed {} on {} blobbers of {} in {}",
            operation,
            accepted.len(),
            allocation_id,
            tx_hash
        );
        Ok(Committed {
            tx_hash,
            markers: accepted,
        })
    }
}
