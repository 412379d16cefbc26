//! Blobber HTTP surface over a [`MemoryNode`], for exercising
//! [`HttpBlobber`](crate::blobber::HttpBlobber) end to end.

use std::{collections::HashMap, net::SocketAddr};

use axum::{
    Json, Router,
    extract::{Multipart, Path, Query, State},
    http::HeaderMap,
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::node::{Caller, MemoryNode};
use crate::{
    api::error::Error as ApiError,
    blobber::{
        CommitAck, FileMeta, HEADER_CLIENT_ID, HEADER_CLIENT_KEY, HEADER_IDEMPOTENCY_KEY,
        HEADER_SIGNATURE_V2, HEADER_TIMESTAMP, ReadRequest, ReadTarget, RootInfo, ShardRead,
        UploadMeta, WriteChunkRequest, WriteChunkResponse, request_hash_v2,
        client::{CommitRequest, ConnectionResponse, RollbackRequest, StageRequest},
    },
    crypto::{client_id_for, verify_ed25519},
    error::{Error, ErrorKind},
};

type Reply<T> = Result<Json<T>, ApiError>;

fn header(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Checks the v2 signature over `path` and returns who signed it.
fn authenticate(node: &MemoryNode, headers: &HeaderMap, allocation_id: &str, path: &str) -> Result<Caller, Error> {
    if allocation_id != node.allocation_id() {
        return Err(Error::file_not_found(format!("allocation {}", allocation_id)));
    }
    let unauthorized = |msg: &str| Error::new(ErrorKind::Unauthorized, msg);
    let public_key = header(headers, HEADER_CLIENT_KEY);
    let client_id = header(headers, HEADER_CLIENT_ID);
    let timestamp: i64 = header(headers, HEADER_TIMESTAMP)
        .parse()
        .map_err(|_| unauthorized("missing request timestamp"))?;
    if client_id_for(&public_key) != client_id {
        return Err(unauthorized("client id does not match its key"));
    }
    let signature = header(headers, HEADER_SIGNATURE_V2);
    if !verify_ed25519(&public_key, &request_hash_v2(path, allocation_id, timestamp), &signature).unwrap_or(false) {
        return Err(unauthorized("request signature does not verify"));
    }
    Ok(Caller {
        client_id,
        public_key,
    })
}

fn read_target(query: &HashMap<String, String>) -> Result<ReadTarget, Error> {
    match query.get("auth_token") {
        Some(ticket) => Ok(ReadTarget::Ticket {
            ticket: ticket.clone(),
            path: query.get("path").cloned(),
        }),
        None => query
            .get("path")
            .map(ReadTarget::path)
            .ok_or_else(|| Error::invalid_parameter("missing path")),
    }
}

async fn post_connection(
    State(node): State<MemoryNode>,
    Path(allocation_id): Path<String>,
    headers: HeaderMap,
) -> Reply<ConnectionResponse> {
    let caller = authenticate(&node, &headers, &allocation_id, "")?;
    let connection_id = node.connect(&caller, &header(&headers, HEADER_IDEMPOTENCY_KEY))?;
    Ok(Json(ConnectionResponse { connection_id }))
}

async fn post_upload(
    State(node): State<MemoryNode>,
    Path(allocation_id): Path<String>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Reply<WriteChunkResponse> {
    let malformed = |e: axum::extract::multipart::MultipartError| {
        Error::invalid_parameter(format!("malformed upload form: {}", e))
    };
    let mut connection_id = None;
    let mut meta: Option<UploadMeta> = None;
    let mut shard_hash = None;
    let mut shard = None;
    let mut thumbnail = None;
    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        let name = field.name().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(malformed)?;
        match name.as_str() {
            "connection_id" => connection_id = Some(String::from_utf8_lossy(&bytes).into_owned()),
            "uploadMeta" => meta = Some(serde_json::from_slice(&bytes).map_err(Error::from)?),
            "shard_hash" => shard_hash = Some(String::from_utf8_lossy(&bytes).into_owned()),
            "uploadFile" => shard = Some(bytes.to_vec()),
            "uploadThumbnail" => thumbnail = Some(bytes.to_vec()),
            _ => {}
        }
    }
    let missing = |field: &str| Error::invalid_parameter(format!("upload form lacks {}", field));
    let meta = meta.ok_or_else(|| missing("uploadMeta"))?;
    let caller = authenticate(&node, &headers, &allocation_id, &meta.path)?;
    let request = WriteChunkRequest {
        connection_id: connection_id.ok_or_else(|| missing("connection_id"))?,
        meta,
        shard: shard.ok_or_else(|| missing("uploadFile"))?,
        shard_hash: shard_hash.ok_or_else(|| missing("shard_hash"))?,
        thumbnail,
    };
    Ok(Json(node.write_chunk(&caller, request)?))
}

async fn post_stage(
    State(node): State<MemoryNode>,
    Path(allocation_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<StageRequest>,
) -> Reply<Value> {
    let caller = authenticate(&node, &headers, &allocation_id, request.change.path())?;
    node.stage(&caller, &request.connection_id, request.change)?;
    Ok(Json(json!({})))
}

async fn post_commit(
    State(node): State<MemoryNode>,
    Path(allocation_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<CommitRequest>,
) -> Reply<CommitAck> {
    let caller = authenticate(&node, &headers, &allocation_id, "")?;
    Ok(Json(node.finalize(&caller, &request.connection_id, request.write_marker)?))
}

async fn post_rollback(
    State(node): State<MemoryNode>,
    Path(allocation_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<RollbackRequest>,
) -> Reply<Value> {
    let caller = authenticate(&node, &headers, &allocation_id, "")?;
    node.rollback(&caller, &request.connection_id)?;
    Ok(Json(json!({})))
}

async fn get_download(
    State(node): State<MemoryNode>,
    Path(allocation_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Reply<ShardRead> {
    let target = read_target(&query)?;
    let caller = authenticate(&node, &headers, &allocation_id, target.signing_path())?;
    let number = |name: &str| -> Result<u64, Error> {
        query
            .get(name)
            .ok_or_else(|| Error::invalid_parameter(format!("missing {}", name)))?
            .parse()
            .map_err(|_| Error::invalid_parameter(format!("malformed {}", name)))
    };
    let request = ReadRequest {
        start_block: number("block_num")?,
        num_blocks: number("num_blocks")?,
        thumbnail: query.get("thumbnail").is_some_and(|v| v == "true"),
        target,
    };
    Ok(Json(node.read_shard(&caller, request)?))
}

async fn get_meta(
    State(node): State<MemoryNode>,
    Path(allocation_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Reply<FileMeta> {
    let target = read_target(&query)?;
    let caller = authenticate(&node, &headers, &allocation_id, target.signing_path())?;
    Ok(Json(node.stat(&caller, &target)?))
}

async fn get_list(
    State(node): State<MemoryNode>,
    Path(allocation_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Reply<Vec<FileMeta>> {
    let target = read_target(&query)?;
    let caller = authenticate(&node, &headers, &allocation_id, target.signing_path())?;
    Ok(Json(node.list(&caller, &target)?))
}

async fn get_root(
    State(node): State<MemoryNode>,
    Path(allocation_id): Path<String>,
    headers: HeaderMap,
) -> Reply<RootInfo> {
    authenticate(&node, &headers, &allocation_id, "")?;
    Ok(Json(node.latest_root()?))
}

pub fn router(node: MemoryNode) -> Router {
    Router::new()
        .route("/v2/connection/{allocation_id}", post(post_connection))
        .route("/v2/connection/rollback/{allocation_id}", post(post_rollback))
        .route("/v2/file/upload/{allocation_id}", post(post_upload))
        .route("/v2/file/stage/{allocation_id}", post(post_stage))
        .route("/v2/commit/{allocation_id}", post(post_commit))
        .route("/v2/file/download/{allocation_id}", get(get_download))
        .route("/v2/file/meta/{allocation_id}", get(get_meta))
        .route("/v2/file/list/{allocation_id}", get(get_list))
        .route("/v2/allocation/root/{allocation_id}", get(get_root))
        .with_state(node)
}

/// Serves `node` on an ephemeral port until `cancel_token` fires and
/// returns its base URL.
pub async fn serve(node: MemoryNode, cancel_token: CancellationToken) -> anyhow::Result<(String, JoinHandle<()>)> {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let base_url = format!("http://{}", listener.local_addr()?);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router(node))
            .with_graceful_shutdown(cancel_token.cancelled_owned())
            .await
        {
            error!("Blobber server failed: {}", e);
        }
    });
    Ok((base_url, handle))
}
