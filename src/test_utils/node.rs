//! In-memory blobber: committed objects, staged connections and a marker
//! chain kept the way a real blobber keeps them. Tests can take it down,
//! slow it, make it corrupt shards or drop objects.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use crate::{
    blobber::{
        BlobberApi, CommitAck, FileMeta, ObjectType, ReadRequest, ReadTarget, RootInfo, ShardRead,
        StagedChange, WriteChunkRequest, WriteChunkResponse,
    },
    codec::MerkleTree,
    crypto::{Credentials, client_id_for, hash, hash_hex, lookup_hash, verify_ed25519},
    error::{Error, ErrorKind, Result},
    marker::{AuthTicket, ReferenceType, WriteMarker, empty_allocation_root, now_unix},
    paths,
};

/// Identity a request arrives with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub client_id: String,
    pub public_key: String,
}

impl Caller {
    pub fn of(credentials: &Credentials) -> Self {
        Self {
            client_id: credentials.client_id.clone(),
            public_key: credentials.public_key.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct Stored {
    meta: FileMeta,
    shards: Vec<Vec<u8>>,
    thumbnail: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct Tree {
    objects: BTreeMap<String, Stored>,
    root: String,
    timestamp: i64,
}

#[derive(Debug)]
struct PendingUpload {
    chunks: BTreeMap<u64, Vec<u8>>,
    thumbnail: Option<Vec<u8>>,
    file: Option<FileMeta>,
}

#[derive(Debug, Clone)]
enum Staged {
    Upload(String),
    Change(StagedChange),
}

#[derive(Debug)]
struct Connection {
    key: String,
    staged: Vec<Staged>,
    uploads: HashMap<String, PendingUpload>,
    /// Accepted marker and the tree it replaced.
    finalized: Option<(WriteMarker, Tree)>,
}

#[derive(Debug)]
struct NodeState {
    tree: Tree,
    connections: HashMap<String, Connection>,
    keys: HashMap<String, String>,
    next_connection: u64,
    alive: bool,
    corrupt: bool,
    fail_after_writes: Option<usize>,
    writes: usize,
    latency: Duration,
    counts: HashMap<&'static str, usize>,
}

#[derive(Clone)]
pub struct MemoryNode {
    id: String,
    allocation_id: String,
    owner_id: String,
    owner_public_key: String,
    data_shards: usize,
    parity_shards: usize,
    state: Arc<Mutex<NodeState>>,
}

fn tree_root(objects: &BTreeMap<String, Stored>) -> String {
    hash_hex(
        objects
            .values()
            .map(|s| s.meta.meta_hash())
            .collect::<Vec<_>>()
            .join(","),
    )
}

impl MemoryNode {
    pub fn new(
        id: impl Into<String>,
        allocation_id: impl Into<String>,
        owner: &Credentials,
        data_shards: usize,
        parity_shards: usize,
    ) -> Self {
        let id = id.into();
        let allocation_id = allocation_id.into();
        let tree = Tree {
            objects: BTreeMap::new(),
            root: empty_allocation_root(&allocation_id, &id),
            timestamp: 0,
        };
        Self {
            id,
            allocation_id,
            owner_id: owner.client_id.clone(),
            owner_public_key: owner.public_key.clone(),
            data_shards,
            parity_shards,
            state: Arc::new(Mutex::new(NodeState {
                tree,
                connections: HashMap::new(),
                keys: HashMap::new(),
                next_connection: 0,
                alive: true,
                corrupt: false,
                fail_after_writes: None,
                writes: 0,
                latency: Duration::ZERO,
                counts: HashMap::new(),
            })),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn allocation_id(&self) -> &str {
        &self.allocation_id
    }

    fn lock(&self) -> Result<MutexGuard<'_, NodeState>> {
        self.state
            .lock()
            .map_err(|_| Error::internal("blobber state poisoned"))
    }

    /// Counts the call and fails it when the node is down.
    fn enter(&self, method: &'static str) -> Result<MutexGuard<'_, NodeState>> {
        let mut state = self.lock()?;
        *state.counts.entry(method).or_default() += 1;
        if !state.alive {
            return Err(Error::transient(format!("blobber {} is down", self.id)));
        }
        Ok(state)
    }

    fn check_owner(&self, caller: &Caller) -> Result<()> {
        if caller.client_id != self.owner_id || client_id_for(&caller.public_key) != caller.client_id {
            return Err(Error::new(
                ErrorKind::Unauthorized,
                format!("{} does not own allocation {}", caller.client_id, self.allocation_id),
            ));
        }
        Ok(())
    }

    fn dir_meta(&self, path: &str, timestamp: i64) -> FileMeta {
        FileMeta {
            path: path.to_string(),
            name: if path == "/" { "/".to_string() } else { paths::file_name(path).to_string() },
            lookup_hash: lookup_hash(&self.allocation_id, path),
            object_type: ObjectType::Dir,
            actual_size: 0,
            chunk_size: 0,
            num_chunks: 0,
            data_shards: self.data_shards,
            parity_shards: self.parity_shards,
            content_hash: String::new(),
            validation_root: String::new(),
            shard_roots: vec![],
            encrypted_key: None,
            thumbnail: None,
            mime_type: String::new(),
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    fn ensure_parents(&self, objects: &mut BTreeMap<String, Stored>, path: &str, timestamp: i64) -> Result<()> {
        for ancestor in paths::ancestors(path).into_iter().filter(|a| a != "/") {
            match objects.get(&ancestor) {
                Some(stored) if stored.meta.is_dir() => {}
                Some(_) => {
                    return Err(Error::invalid_path(format!("{} is not a directory", ancestor)));
                }
                None => {
                    let meta = self.dir_meta(&ancestor, timestamp);
                    objects.insert(
                        ancestor,
                        Stored {
                            meta,
                            shards: vec![],
                            thumbnail: None,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    fn apply_change(
        &self,
        objects: &mut BTreeMap<String, Stored>,
        change: &StagedChange,
        timestamp: i64,
    ) -> Result<()> {
        let path = change.path();
        match change {
            StagedChange::Delete { .. } => {
                if !objects.contains_key(path) {
                    return Err(Error::file_not_found(path));
                }
                objects.retain(|k, _| !paths::is_within(k, path));
            }
            StagedChange::CreateDir { .. } => {
                if objects.contains_key(path) {
                    return Err(Error::new(ErrorKind::Conflict, format!("{} already exists", path)));
                }
                self.ensure_parents(objects, path, timestamp)?;
                let meta = self.dir_meta(path, timestamp);
                objects.insert(
                    path.to_string(),
                    Stored {
                        meta,
                        shards: vec![],
                        thumbnail: None,
                    },
                );
            }
            StagedChange::Rename { .. } | StagedChange::Copy { .. } | StagedChange::Move { .. } => {
                let dest = change
                    .dest_path()
                    .ok_or_else(|| Error::internal("relocation without destination"))?;
                if !objects.contains_key(path) {
                    return Err(Error::file_not_found(path));
                }
                if objects.contains_key(&dest) {
                    return Err(Error::new(ErrorKind::Conflict, format!("{} already exists", dest)));
                }
                let dest_dir = paths::parent(&dest);
                if dest_dir != "/" && !objects.get(dest_dir).is_some_and(|s| s.meta.is_dir()) {
                    return Err(Error::file_not_found(dest_dir));
                }
                let moved: Vec<(String, Stored)> = objects
                    .iter()
                    .filter(|(k, _)| paths::is_within(k, path))
                    .map(|(k, stored)| {
                        let new_path = format!("{}{}", dest, &k[path.len()..]);
                        let mut stored = stored.clone();
                        stored.meta.path = new_path.clone();
                        stored.meta.name = paths::file_name(&new_path).to_string();
                        stored.meta.lookup_hash = lookup_hash(&self.allocation_id, &new_path);
                        stored.meta.updated_at = timestamp;
                        if matches!(change, StagedChange::Copy { .. }) {
                            stored.meta.created_at = timestamp;
                        }
                        (new_path, stored)
                    })
                    .collect();
                if !matches!(change, StagedChange::Copy { .. }) {
                    objects.retain(|k, _| !paths::is_within(k, path));
                }
                objects.extend(moved);
            }
        }
        Ok(())
    }

    /// Path a read resolves to, after checking the owner or the ticket.
    fn resolve(&self, tree: &Tree, caller: &Caller, target: &ReadTarget) -> Result<String> {
        match target {
            ReadTarget::Path { path } => {
                self.check_owner(caller)?;
                paths::validate(path)?;
                Ok(path.clone())
            }
            ReadTarget::Ticket { ticket, path } => {
                let ticket = AuthTicket::decode(ticket)?;
                ticket.check(now_unix(), Some(&caller.client_id))?;
                if ticket.allocation_id != self.allocation_id || ticket.owner_id != self.owner_id {
                    return Err(Error::auth_ticket("ticket is for another allocation"));
                }
                let signed = verify_ed25519(
                    &self.owner_public_key,
                    &hash_hex(ticket.canonical()),
                    &ticket.signature,
                )
                .unwrap_or(false);
                if !signed {
                    return Err(Error::auth_ticket("ticket is not signed by the owner"));
                }
                let shared = tree
                    .objects
                    .values()
                    .find(|s| s.meta.lookup_hash == ticket.file_path_hash)
                    .map(|s| s.meta.path.clone())
                    .ok_or_else(|| Error::file_not_found(&ticket.file_name))?;
                match (ticket.reference_type, path) {
                    (_, None) => Ok(shared),
                    (ReferenceType::File, Some(_)) => {
                        Err(Error::invalid_parameter("a file ticket takes no sub-path"))
                    }
                    (ReferenceType::Directory, Some(p)) if paths::is_within(p, &shared) => Ok(p.clone()),
                    (ReferenceType::Directory, Some(p)) => Err(Error::new(
                        ErrorKind::Unauthorized,
                        format!("{} is outside the shared directory", p),
                    )),
                }
            }
        }
    }

    pub fn connect(&self, caller: &Caller, idempotency_key: &str) -> Result<String> {
        let mut state = self.enter("new_connection")?;
        self.check_owner(caller)?;
        if let Some(id) = state.keys.get(idempotency_key) {
            if state.connections.contains_key(id) {
                return Ok(id.clone());
            }
        }
        state.next_connection += 1;
        let id = format!("{}-{}", &self.id[..self.id.len().min(8)], state.next_connection);
        state.connections.insert(
            id.clone(),
            Connection {
                key: idempotency_key.to_string(),
                staged: vec![],
                uploads: HashMap::new(),
                finalized: None,
            },
        );
        state.keys.insert(idempotency_key.to_string(), id.clone());
        Ok(id)
    }

    pub fn write_chunk(&self, caller: &Caller, request: WriteChunkRequest) -> Result<WriteChunkResponse> {
        let mut state = self.enter("write_chunk")?;
        self.check_owner(caller)?;
        if state.fail_after_writes.is_some_and(|limit| state.writes >= limit) {
            return Err(Error::transient(format!("blobber {} stopped accepting writes", self.id)));
        }
        paths::validate(&request.meta.path)?;
        if hash_hex(&request.shard) != request.shard_hash {
            return Err(Error::corrupted_shards("shard does not match its hash"));
        }
        let connection = state
            .connections
            .get_mut(&request.connection_id)
            .ok_or_else(|| Error::invalid_parameter(format!("unknown connection {}", request.connection_id)))?;
        if connection.finalized.is_some() {
            return Err(Error::new(ErrorKind::Conflict, "connection already committed"));
        }
        let path = request.meta.path.clone();
        if !connection.uploads.contains_key(&path) {
            connection.staged.push(Staged::Upload(path.clone()));
        }
        let upload = connection.uploads.entry(path).or_insert_with(|| PendingUpload {
            chunks: BTreeMap::new(),
            thumbnail: None,
            file: None,
        });
        upload.chunks.insert(request.meta.chunk_index, request.shard);
        if let Some(thumbnail) = request.thumbnail {
            upload.thumbnail = Some(thumbnail);
        }
        if let Some(file) = request.meta.file {
            upload.file = Some(file);
        }
        state.writes += 1;
        Ok(WriteChunkResponse {
            accepted: true,
            current_root: tree_root(&state.tree.objects),
        })
    }

    pub fn stage(&self, caller: &Caller, connection_id: &str, change: StagedChange) -> Result<()> {
        let mut state = self.enter("stage")?;
        self.check_owner(caller)?;
        let mut view = state.tree.objects.clone();
        let connection = state
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| Error::invalid_parameter(format!("unknown connection {}", connection_id)))?;
        if connection.finalized.is_some() {
            return Err(Error::new(ErrorKind::Conflict, "connection already committed"));
        }
        let now = now_unix();
        for staged in &connection.staged {
            if let Staged::Change(earlier) = staged {
                self.apply_change(&mut view, earlier, now)?;
            }
        }
        self.apply_change(&mut view, &change, now)?;
        connection.staged.push(Staged::Change(change));
        Ok(())
    }

    pub fn finalize(&self, caller: &Caller, connection_id: &str, marker: WriteMarker) -> Result<CommitAck> {
        let mut state = self.enter("finalize")?;
        self.check_owner(caller)?;
        marker.validate(&self.allocation_id, &self.id)?;
        if marker.client_id != caller.client_id {
            return Err(Error::marker_rejected("marker signed for another client"));
        }
        if !verify_ed25519(&caller.public_key, &marker.signing_hash(), &marker.signature).unwrap_or(false) {
            return Err(Error::marker_rejected("marker signature does not verify"));
        }
        let tree = state.tree.clone();
        let connection = state
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| Error::invalid_parameter(format!("unknown connection {}", connection_id)))?;
        if let Some((accepted, _)) = &connection.finalized {
            if *accepted == marker {
                return Ok(CommitAck {
                    allocation_root: accepted.allocation_root.clone(),
                });
            }
            return Err(Error::marker_rejected("connection already committed another marker"));
        }
        if marker.prev_allocation_root != tree.root {
            return Err(Error::marker_rejected(format!(
                "previous root {} does not match {}",
                marker.prev_allocation_root, tree.root
            )));
        }
        if marker.timestamp < tree.timestamp {
            return Err(Error::marker_rejected("marker is older than the latest commit"));
        }

        let mut objects = tree.objects.clone();
        for staged in &connection.staged {
            match staged {
                Staged::Change(change) => self.apply_change(&mut objects, change, marker.timestamp)?,
                Staged::Upload(path) => {
                    let upload = connection
                        .uploads
                        .get(path)
                        .ok_or_else(|| Error::internal(format!("no pending upload for {}", path)))?;
                    let file = upload
                        .file
                        .clone()
                        .ok_or_else(|| Error::invalid_parameter(format!("{} has no final chunk", path)))?;
                    let complete = upload.chunks.len() as u64 == file.num_chunks
                        && upload.chunks.keys().copied().eq(0..file.num_chunks);
                    if !complete {
                        return Err(Error::invalid_parameter(format!(
                            "{} holds {} of {} chunks",
                            path,
                            upload.chunks.len(),
                            file.num_chunks
                        )));
                    }
                    if objects.get(path).is_some_and(|s| s.meta.is_dir()) {
                        return Err(Error::invalid_path(format!("{} is a directory", path)));
                    }
                    self.ensure_parents(&mut objects, path, marker.timestamp)?;
                    objects.insert(
                        path.clone(),
                        Stored {
                            meta: file,
                            shards: upload.chunks.values().cloned().collect(),
                            thumbnail: upload.thumbnail.clone(),
                        },
                    );
                }
            }
        }
        let allocation_root = marker.allocation_root.clone();
        connection.finalized = Some((marker.clone(), tree));
        state.tree = Tree {
            objects,
            root: allocation_root.clone(),
            timestamp: marker.timestamp,
        };
        Ok(CommitAck { allocation_root })
    }

    /// Drops the connection. A finalized connection is reverted as long as
    /// nothing was committed on top of it.
    pub fn rollback(&self, caller: &Caller, connection_id: &str) -> Result<()> {
        let mut state = self.enter("rollback")?;
        self.check_owner(caller)?;
        let Some(connection) = state.connections.remove(connection_id) else {
            return Ok(());
        };
        state.keys.remove(&connection.key);
        if let Some((marker, previous)) = connection.finalized {
            if state.tree.root == marker.allocation_root {
                state.tree = previous;
            }
        }
        Ok(())
    }

    pub fn read_shard(&self, caller: &Caller, request: ReadRequest) -> Result<ShardRead> {
        let state = self.enter("read_shard")?;
        let path = self.resolve(&state.tree, caller, &request.target)?;
        let stored = state
            .tree
            .objects
            .get(&path)
            .filter(|s| !s.meta.is_dir())
            .ok_or_else(|| Error::file_not_found(&path))?;
        let mut read = if request.thumbnail {
            ShardRead {
                data: stored
                    .thumbnail
                    .clone()
                    .ok_or_else(|| Error::file_not_found(format!("thumbnail of {}", path)))?,
                proofs: vec![],
            }
        } else {
            let end = request.start_block + request.num_blocks;
            if request.num_blocks == 0 || end > stored.shards.len() as u64 {
                return Err(Error::invalid_parameter(format!(
                    "blocks {}..{} outside {} stored",
                    request.start_block,
                    end,
                    stored.shards.len()
                )));
            }
            let column = MerkleTree::new(stored.shards.iter().map(hash).collect());
            let mut data = vec![];
            let mut proofs = vec![];
            for block in request.start_block..end {
                data.extend_from_slice(&stored.shards[block as usize]);
                proofs.push(
                    column
                        .proof(block as usize)
                        .ok_or_else(|| Error::internal("proof outside column"))?,
                );
            }
            ShardRead { data, proofs }
        };
        if state.corrupt {
            if let Some(byte) = read.data.first_mut() {
                *byte ^= 0xff;
            }
        }
        Ok(read)
    }

    pub fn stat(&self, caller: &Caller, target: &ReadTarget) -> Result<FileMeta> {
        let state = self.enter("stat")?;
        let path = self.resolve(&state.tree, caller, target)?;
        if path == "/" {
            return Ok(self.dir_meta("/", 0));
        }
        state
            .tree
            .objects
            .get(&path)
            .map(|s| s.meta.clone())
            .ok_or_else(|| Error::file_not_found(&path))
    }

    pub fn list(&self, caller: &Caller, target: &ReadTarget) -> Result<Vec<FileMeta>> {
        let state = self.enter("list")?;
        let path = self.resolve(&state.tree, caller, target)?;
        if path != "/" {
            match state.tree.objects.get(&path) {
                Some(stored) if stored.meta.is_dir() => {}
                Some(_) => return Err(Error::invalid_parameter(format!("{} is not a directory", path))),
                None => return Err(Error::file_not_found(&path)),
            }
        }
        Ok(state
            .tree
            .objects
            .iter()
            .filter(|(k, _)| k.as_str() != path && paths::parent(k) == path)
            .map(|(_, s)| s.meta.clone())
            .collect())
    }

    pub fn latest_root(&self) -> Result<RootInfo> {
        let state = self.enter("latest_root")?;
        Ok(RootInfo {
            allocation_root: state.tree.root.clone(),
            timestamp: state.tree.timestamp,
        })
    }

    async fn pause(&self) {
        let latency = self.lock().map(|s| s.latency).unwrap_or_default();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    pub fn kill(&self) {
        if let Ok(mut state) = self.lock() {
            state.alive = false;
        }
    }

    pub fn heal(&self) {
        if let Ok(mut state) = self.lock() {
            state.alive = true;
        }
    }

    pub fn set_corrupt(&self, corrupt: bool) {
        if let Ok(mut state) = self.lock() {
            state.corrupt = corrupt;
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut state) = self.lock() {
            state.latency = latency;
        }
    }

    /// Fails every `write_chunk` once `limit` chunks were accepted.
    pub fn fail_after_writes(&self, limit: Option<usize>) {
        if let Ok(mut state) = self.lock() {
            state.fail_after_writes = limit;
            state.writes = 0;
        }
    }

    pub fn count(&self, method: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|s| s.counts.get(method).copied())
            .unwrap_or(0)
    }

    pub fn reset_counts(&self) {
        if let Ok(mut state) = self.lock() {
            state.counts.clear();
        }
    }

    pub fn root(&self) -> String {
        self.lock().map(|s| s.tree.root.clone()).unwrap_or_default()
    }

    pub fn object(&self, path: &str) -> Option<FileMeta> {
        self.lock()
            .ok()
            .and_then(|s| s.tree.objects.get(path).map(|o| o.meta.clone()))
    }

    pub fn paths(&self) -> Vec<String> {
        self.lock()
            .map(|s| s.tree.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Loses an object without touching the marker chain.
    pub fn drop_object(&self, path: &str) {
        if let Ok(mut state) = self.lock() {
            state.tree.objects.retain(|k, _| !paths::is_within(k, path));
        }
    }

    pub fn open_connections(&self) -> usize {
        self.lock().map(|s| s.connections.len()).unwrap_or(0)
    }

    /// Binds the node to a client identity.
    pub fn client(&self, credentials: &Credentials) -> MemoryBlobber {
        MemoryBlobber {
            node: self.clone(),
            caller: Caller::of(credentials),
        }
    }
}

/// [`BlobberApi`] over a [`MemoryNode`] for one client.
#[derive(Clone)]
pub struct MemoryBlobber {
    node: MemoryNode,
    caller: Caller,
}

impl MemoryBlobber {
    pub fn node(&self) -> &MemoryNode {
        &self.node
    }
}

impl BlobberApi for MemoryBlobber {
    fn id(&self) -> &str {
        &self.node.id
    }
    async fn new_connection(&self, idempotency_key: &str) -> Result<String> {
        self.node.pause().await;
        self.node.connect(&self.caller, idempotency_key)
    }
    async fn write_chunk(&self, request: WriteChunkRequest) -> Result<WriteChunkResponse> {
        self.node.pause().await;
        self.node.write_chunk(&self.caller, request)
    }
    async fn stage(&self, connection_id: &str, change: StagedChange) -> Result<()> {
        self.node.pause().await;
        self.node.stage(&self.caller, connection_id, change)
    }
    async fn finalize(&self, connection_id: &str, marker: WriteMarker) -> Result<CommitAck> {
        self.node.pause().await;
        self.node.finalize(&self.caller, connection_id, marker)
    }
    async fn rollback(&self, connection_id: &str) -> Result<()> {
        self.node.pause().await;
        self.node.rollback(&self.caller, connection_id)
    }
    async fn read_shard(&self, request: ReadRequest) -> Result<ShardRead> {
        self.node.pause().await;
        self.node.read_shard(&self.caller, request)
    }
    async fn stat(&self, target: ReadTarget) -> Result<FileMeta> {
        self.node.pause().await;
        self.node.stat(&self.caller, &target)
    }
    async fn list(&self, target: ReadTarget) -> Result<Vec<FileMeta>> {
        self.node.pause().await;
        self.node.list(&self.caller, &target)
    }
    async fn latest_root(&self) -> Result<RootInfo> {
        self.node.pause().await;
        self.node.latest_root()
    }
}
