use std::sync::Arc;

use anyhow::Result;
use axum::http::{HeaderValue, StatusCode, header};
use axum_test::{TestResponse, TestServer};
use serde::Deserialize;
use shardbox::{
    allocation::UploadOptions,
    api::{Env, router},
    blobber::FileMeta,
    error::ErrorEnvelope,
    test_utils::{TestNetwork, random_bytes, upload_bytes},
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
struct MetaResponse {
    result: FileMeta,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    result: Vec<FileMeta>,
}

async fn create_test_app(files: &[(&str, Vec<u8>)]) -> Result<(TestServer, TestNetwork)> {
    let net = TestNetwork::new(2, 2);
    let ctx = net.context()?;
    for (path, bytes) in files {
        let options = UploadOptions::builder().mime_type("video/mp4").build();
        upload_bytes(&ctx, path, bytes.clone(), options).await?;
    }
    let env = Env {
        context: Arc::new(ctx),
        cancel_token: CancellationToken::new(),
    };
    Ok((TestServer::new(router::new(env))?, net))
}

fn content_range(response: &TestResponse) -> Result<(u64, u64, u64)> {
    let value = response.header(header::CONTENT_RANGE);
    let value = value.to_str()?;
    let (span, total) = value
        .strip_prefix("bytes ")
        .and_then(|v| v.split_once('/'))
        .ok_or_else(|| anyhow::anyhow!("malformed content range {}", value))?;
    let (start, end) = span
        .split_once('-')
        .ok_or_else(|| anyhow::anyhow!("malformed content range {}", value))?;
    Ok((start.parse()?, end.parse()?, total.parse()?))
}

#[tokio::test]
async fn test_health() -> Result<()> {
    let (server, _net) = create_test_app(&[]).await?;
    let response = server.get("/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "OK");
    Ok(())
}

#[tokio::test]
async fn test_stream_whole_object() -> Result<()> {
    let data = random_bytes(6_000);
    let (server, _net) = create_test_app(&[("/clips/intro.mp4", data.clone())]).await?;

    let response = server.get("/stream/clips/intro.mp4").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.header(header::CONTENT_TYPE), "video/mp4");
    assert_eq!(response.header(header::ACCEPT_RANGES), "bytes");
    assert_eq!(response.as_bytes().as_ref(), data.as_slice());
    Ok(())
}

#[tokio::test]
async fn test_stream_range_returns_partial_window() -> Result<()> {
    let data = random_bytes(20 * 1024);
    let (server, _net) = create_test_app(&[("/movie.mp4", data.clone())]).await?;

    let response = server
        .get("/stream/movie.mp4")
        .add_header(header::RANGE, HeaderValue::from_static("bytes=1100-"))
        .await;
    assert_eq!(response.status_code(), StatusCode::PARTIAL_CONTENT);
    let (start, end, total) = content_range(&response)?;
    assert_eq!((start, end, total), (1024, 5 * 1024 - 1, data.len() as u64));
    assert_eq!(
        response.as_bytes().as_ref(),
        &data[start as usize..=end as usize]
    );

    let response = server
        .get("/stream/movie.mp4")
        .add_header(header::RANGE, HeaderValue::from_static("bytes=-100"))
        .await;
    assert_eq!(response.status_code(), StatusCode::PARTIAL_CONTENT);
    let (start, end, _) = content_range(&response)?;
    assert!(start <= data.len() as u64 - 100);
    assert_eq!(end, data.len() as u64 - 1);
    assert_eq!(response.as_bytes().as_ref(), &data[start as usize..]);
    Ok(())
}

#[tokio::test]
async fn test_meta_and_list() -> Result<()> {
    let (server, _net) = create_test_app(&[
        ("/a.mp4", random_bytes(10)),
        ("/dir/b.mp4", random_bytes(20)),
    ])
    .await?;

    let response = server.get("/meta/dir/b.mp4").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let meta: MetaResponse = serde_json::from_slice(response.as_bytes())?;
    assert_eq!(meta.result.path, "/dir/b.mp4");
    assert_eq!(meta.result.actual_size, 20);

    let response = server.get("/list").await;
    let root: ListResponse = serde_json::from_slice(response.as_bytes())?;
    let names: Vec<&str> = root.result.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["a.mp4", "dir"]);

    let response = server.get("/list/dir").await;
    let dir: ListResponse = serde_json::from_slice(response.as_bytes())?;
    assert_eq!(dir.result.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_errors_use_the_envelope() -> Result<()> {
    let (server, _net) = create_test_app(&[("/x.mp4", random_bytes(100))]).await?;

    let response = server.get("/stream/missing.mp4").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    let envelope: ErrorEnvelope = serde_json::from_slice(response.as_bytes())?;
    assert_eq!(envelope.code, "file_not_found");

    let response = server
        .get("/stream/x.mp4")
        .add_header(header::RANGE, HeaderValue::from_static("lines=0-10"))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    let envelope: ErrorEnvelope = serde_json::from_slice(response.as_bytes())?;
    assert_eq!(envelope.code, "invalid_parameter");

    let response = server
        .get("/stream/x.mp4")
        .add_header(header::RANGE, HeaderValue::from_static("bytes=500-"))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn test_dead_network_maps_to_bad_gateway() -> Result<()> {
    let (server, net) = create_test_app(&[("/gone.mp4", random_bytes(3_000))]).await?;
    for node in &net.nodes {
        node.kill();
    }
    let response = server.get("/stream/gone.mp4").await;
    assert_eq!(response.status_code(), StatusCode::BAD_GATEWAY);
    let envelope: ErrorEnvelope = serde_json::from_slice(response.as_bytes())?;
    assert_eq!(envelope.code, "consensus_not_reached");
    Ok(())
}
