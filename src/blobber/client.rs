use std::time::Duration;

use reqwest::{
    Client as HttpClient, ClientBuilder, Response,
    header::{HeaderMap, HeaderValue},
    multipart::{Form, Part},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::debug;

use super::{
    BlobberApi, CommitAck, FileMeta, HEADER_CLIENT_ID, HEADER_CLIENT_KEY, HEADER_IDEMPOTENCY_KEY,
    HEADER_SIGNATURE, HEADER_SIGNATURE_V2, HEADER_TIMESTAMP, ReadRequest, ReadTarget,
    RequestAuth, RootInfo, ShardRead, StagedChange, WriteChunkRequest, WriteChunkResponse,
};
use crate::{
    crypto::Credentials,
    error::{Error, ErrorEnvelope, ErrorKind, Result},
    marker::WriteMarker,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionResponse {
    pub connection_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StageRequest {
    pub connection_id: String,
    pub change: StagedChange,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommitRequest {
    pub connection_id: String,
    pub write_marker: WriteMarker,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub connection_id: String,
}

/// Blobber reached over HTTP. Every request is signed with the session's
/// credentials.
#[derive(Clone, Debug)]
pub struct HttpBlobber {
    client: HttpClient,
    id: String,
    base_url: String,
    allocation_id: String,
    credentials: Credentials,
}

impl HttpBlobber {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        allocation_id: impl Into<String>,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<Self> {
        let client = ClientBuilder::new()
            .default_headers({
                let mut headers = HeaderMap::new();
                headers.insert("Accept", "application/json".parse()?);
                headers
            })
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            allocation_id: allocation_id.into(),
            credentials,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/v2/{}/{}", self.base_url, endpoint, self.allocation_id)
    }

    fn headers(&self, path: &str, idempotency_key: &str) -> Result<HeaderMap> {
        let auth = RequestAuth::sign(&self.credentials, &self.allocation_id, path, idempotency_key)?;
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_CLIENT_ID, HeaderValue::from_str(&auth.client_id)?);
        headers.insert(HEADER_CLIENT_KEY, HeaderValue::from_str(&auth.public_key)?);
        headers.insert(HEADER_SIGNATURE, HeaderValue::from_str(&auth.signature)?);
        headers.insert(HEADER_SIGNATURE_V2, HeaderValue::from_str(&auth.signature_v2)?);
        headers.insert(HEADER_TIMESTAMP, HeaderValue::from(auth.timestamp));
        headers.insert(
            HEADER_IDEMPOTENCY_KEY,
            HeaderValue::from_str(&auth.idempotency_key)?,
        );
        Ok(headers)
    }

    async fn handle_response<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        let body = response.text().await.unwrap_or_default();
        let error = match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(envelope) => Error::from_envelope(envelope),
            Err(_) => Error::new(
                ErrorKind::from_status(status.as_u16()),
                format!("blobber {} returned {}: {}", self.id, status, body),
            ),
        };
        debug!("Blobber {} request failed: {}", self.id, error);
        Err(error)
    }

    fn target_query(target: &ReadTarget) -> String {
        match target {
            ReadTarget::Path { path } => format!("path={}", urlencoding::encode(path)),
            ReadTarget::Ticket { ticket, path } => {
                let mut query = format!("auth_token={}", urlencoding::encode(ticket));
                if let Some(path) = path {
                    query.push_str(&format!("&path={}", urlencoding::encode(path)));
                }
                query
            }
        }
    }

    pub async fn new_connection(&self, idempotency_key: &str) -> Result<String> {
        let response = self
            .client
            .post(self.url("connection"))
            .headers(self.headers("", idempotency_key)?)
            .send()
            .await?;
        let connection: ConnectionResponse = self.handle_response(response).await?;
        Ok(connection.connection_id)
    }

    pub async fn write_chunk(&self, request: WriteChunkRequest) -> Result<WriteChunkResponse> {
        let idempotency_key = format!("{}:{}", request.connection_id, request.meta.chunk_index);
        let headers = self.headers(&request.meta.path, &idempotency_key)?;
        let mut form = Form::new()
            .text("connection_id", request.connection_id)
            .text("uploadMeta", serde_json::to_string(&request.meta)?)
            .text("shard_hash", request.shard_hash)
            .part("uploadFile", Part::bytes(request.shard).file_name("shard"));
        if let Some(thumbnail) = request.thumbnail {
            form = form.part("uploadThumbnail", Part::bytes(thumbnail).file_name("thumbnail"));
        }
        let response = self
            .client
            .post(self.url("file/upload"))
            .headers(headers)
            .multipart(form)
            .send()
            .await?;
        self.handle_response(response).await
    }

    pub async fn stage(&self, connection_id: &str, change: StagedChange) -> Result<()> {
        let headers = self.headers(change.path(), connection_id)?;
        let response = self
            .client
            .post(self.url("file/stage"))
            .headers(headers)
            .json(&StageRequest {
                connection_id: connection_id.to_string(),
                change,
            })
            .send()
            .await?;
        let _: serde_json::Value = self.handle_response(response).await?;
        Ok(())
    }

    pub async fn finalize(&self, connection_id: &str, marker: WriteMarker) -> Result<CommitAck> {
        let headers = self.headers("", connection_id)?;
        let response = self
            .client
            .post(self.url("commit"))
            .headers(headers)
            .json(&CommitRequest {
                connection_id: connection_id.to_string(),
                write_marker: marker,
            })
            .send()
            .await?;
        self.handle_response(response).await
    }

    pub async fn rollback(&self, connection_id: &str) -> Result<()> {
        let headers = self.headers("", connection_id)?;
        let response = self
            .client
            .post(self.url("connection/rollback"))
            .headers(headers)
            .json(&RollbackRequest {
                connection_id: connection_id.to_string(),
            })
            .send()
            .await?;
        let _: serde_json::Value = self.handle_response(response).await?;
        Ok(())
    }

    pub async fn read_shard(&self, request: ReadRequest) -> Result<ShardRead> {
        let url = format!(
            "{}?{}&block_num={}&num_blocks={}&thumbnail={}",
            self.url("file/download"),
            Self::target_query(&request.target),
            request.start_block,
            request.num_blocks,
            request.thumbnail
        );
        let response = self
            .client
            .get(url)
            .headers(self.headers(request.target.signing_path(), "")?)
            .send()
            .await?;
        self.handle_response(response).await
    }

    pub async fn stat(&self, target: ReadTarget) -> Result<FileMeta> {
        let url = format!("{}?{}", self.url("file/meta"), Self::target_query(&target));
        let response = self
            .client
            .get(url)
            .headers(self.headers(target.signing_path(), "")?)
            .send()
            .await?;
        self.handle_response(response).await
    }

    pub async fn list(&self, target: ReadTarget) -> Result<Vec<FileMeta>> {
        let url = format!("{}?{}", self.url("file/list"), Self::target_query(&target));
        let response = self
            .client
            .get(url)
            .headers(self.headers(target.signing_path(), "")?)
            .send()
            .await?;
        self.handle_response(response).await
    }

    pub async fn latest_root(&self) -> Result<RootInfo> {
        let response = self
            .client
            .get(self.url("allocation/root"))
            .headers(self.headers("", "")?)
            .send()
            .await?;
        self.handle_response(response).await
    }
}

impl BlobberApi for HttpBlobber {
    fn id(&self) -> &str {
        &self.id
    }
    async fn new_connection(&self, idempotency_key: &str) -> Result<String> {
        self.new_connection(idempotency_key).await
    }
    async fn write_chunk(&self, request: WriteChunkRequest) -> Result<WriteChunkResponse> {
        self.write_chunk(request).await
    }
    async fn stage(&self, connection_id: &str, change: StagedChange) -> Result<()> {
        self.stage(connection_id, change).await
    }
    async fn finalize(&self, connection_id: &str, marker: WriteMarker) -> Result<CommitAck> {
        self.finalize(connection_id, marker).await
    }
    async fn rollback(&self, connection_id: &str) -> Result<()> {
        self.rollback(connection_id).await
    }
    async fn read_shard(&self, request: ReadRequest) -> Result<ShardRead> {
        self.read_shard(request).await
    }
    async fn stat(&self, target: ReadTarget) -> Result<FileMeta> {
        self.stat(target).await
    }
    async fn list(&self, target: ReadTarget) -> Result<Vec<FileMeta>> {
        self.list(target).await
    }
    async fn latest_root(&self) -> Result<RootInfo> {
        self.latest_root().await
    }
}
