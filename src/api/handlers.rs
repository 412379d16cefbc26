use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use tracing::debug;

use super::{Env, error::Error, result::Result};
use crate::{
    allocation::DownloadOptions,
    blobber::{BlobberApi, FileMeta},
    chain::ChainFacade,
    download::ByteRange,
    error::Error as CoreError,
};

fn remote_path(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

pub async fn get_health() -> &'static str {
    "OK"
}

pub async fn get_meta<B: BlobberApi, C: ChainFacade>(
    State(env): State<Env<B, C>>,
    Path(path): Path<String>,
) -> Result<FileMeta> {
    Ok(env.context.stat(&remote_path(&path)).await?.into())
}

pub async fn get_list_root<B: BlobberApi, C: ChainFacade>(
    State(env): State<Env<B, C>>,
) -> Result<Vec<FileMeta>> {
    Ok(env.context.list("/").await?.into())
}

pub async fn get_list<B: BlobberApi, C: ChainFacade>(
    State(env): State<Env<B, C>>,
    Path(path): Path<String>,
) -> Result<Vec<FileMeta>> {
    Ok(env.context.list(&remote_path(&path)).await?.into())
}

/// Serves an object, honouring a single `Range`. Partial answers carry the
/// block-aligned window actually delivered.
pub async fn get_stream<B: BlobberApi, C: ChainFacade>(
    State(env): State<Env<B, C>>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> std::result::Result<Response, Error> {
    let path = remote_path(&path);
    let meta = env.context.stat(&path).await?;
    let range = match headers.get(header::RANGE) {
        Some(value) if meta.actual_size > 0 => {
            let value = value
                .to_str()
                .map_err(|_| CoreError::invalid_parameter("range header is not ASCII"))?;
            Some(ByteRange::parse_header(value, meta.actual_size)?)
        }
        _ => None,
    };
    let options = DownloadOptions {
        range: range.unwrap_or_default(),
        aligned: range.is_some(),
    };
    let mut body = Vec::new();
    let report = env
        .context
        .download(&path, &mut body, options, env.cancel_token.child_token())
        .await?;
    debug!("Streaming {} as {}", path, report.content_range());

    let mut response = Response::builder()
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, body.len());
    if let Ok(mime) = HeaderValue::from_str(&meta.mime_type) {
        response = response.header(header::CONTENT_TYPE, mime);
    }
    response = match range {
        Some(_) => response
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, report.content_range()),
        None => response.status(StatusCode::OK),
    };
    response
        .body(Body::from(body))
        .map_err(|e| CoreError::internal(format!("response build failed: {}", e)).into())
}
