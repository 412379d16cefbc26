use std::time::Duration;

use futures_util::future::join_all;
use reqwest::{Client as HttpClient, ClientBuilder, Response, header::HeaderMap};
use serde::{Deserialize, de::DeserializeOwned};
use tracing::{debug, warn};

use super::{ChainFacade, Confirmation, Transaction};
use crate::{
    allocation::Allocation,
    error::{Error, ErrorEnvelope, ErrorKind, Result},
};

#[derive(Debug, Deserialize)]
struct ConfirmationResponse {
    #[serde(default)]
    confirmation: Option<ConfirmationBody>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfirmationBody {
    #[serde(default)]
    transaction_status: i32,
    #[serde(default)]
    transaction_output: String,
}

/// Miners take submissions; sharders answer queries.
#[derive(Clone, Debug)]
pub struct HttpChain {
    client: HttpClient,
    miners: Vec<String>,
    sharders: Vec<String>,
    storage_sc_address: String,
}

impl HttpChain {
    pub fn new(
        miners: Vec<String>,
        sharders: Vec<String>,
        storage_sc_address: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        if sharders.is_empty() {
            return Err(Error::not_initialized("no sharders configured"));
        }
        let client = ClientBuilder::new()
            .default_headers({
                let mut headers = HeaderMap::new();
                headers.insert("Content-Type", "application/json".parse()?);
                headers.insert("Accept", "application/json".parse()?);
                headers
            })
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            miners: miners
                .into_iter()
                .map(|m| m.trim_end_matches('/').to_string())
                .collect(),
            sharders: sharders
                .into_iter()
                .map(|s| s.trim_end_matches('/').to_string())
                .collect(),
            storage_sc_address: storage_sc_address.into(),
        })
    }

    pub fn storage_sc_address(&self) -> &str {
        &self.storage_sc_address
    }

    async fn handle_response<T: DeserializeOwned>(response: Response, fallback: ErrorKind) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(envelope) => Error::from_envelope(envelope),
            Err(_) => {
                let kind = match ErrorKind::from_status(status.as_u16()) {
                    ErrorKind::TransientRpc | ErrorKind::TooManyRequests => fallback,
                    kind => kind,
                };
                Error::new(kind, format!("chain returned {}: {}", status, body))
            }
        })
    }

    /// Submits to every miner; one acceptance is enough.
    pub async fn submit(&self, txn: &Transaction) -> Result<()> {
        if self.miners.is_empty() {
            return Err(Error::not_initialized("no miners configured"));
        }
        let results = join_all(self.miners.iter().map(|miner| async move {
            let response = self
                .client
                .post(format!("{}/v1/transaction/put", miner))
                .json(txn)
                .send()
                .await
                .map_err(|e| {
                    Error::new(ErrorKind::TransactionSendError, format!("{}: {}", miner, e))
                })?;
            Self::handle_response::<serde_json::Value>(response, ErrorKind::TransactionSendError)
                .await
        }))
        .await;
        let mut last_error = None;
        for result in results {
            match result {
                Ok(_) => {
                    debug!("Transaction {} accepted", txn.hash);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Miner rejected transaction {}: {}", txn.hash, e);
                    last_error = Some(e);
                }
            }
        }
        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(Error::new(
            ErrorKind::TransactionSendError,
            format!("no miner accepted transaction {}: {}", txn.hash, reason),
        ))
    }

    pub async fn query_confirmation(&self, sharder: usize, txn_hash: &str) -> Result<Confirmation> {
        let base = self
            .sharders
            .get(sharder)
            .ok_or_else(|| Error::invalid_parameter(format!("no sharder {}", sharder)))?;
        let response = self
            .client
            .get(format!(
                "{}/v1/transaction/get/confirmation?hash={}",
                base,
                urlencoding::encode(txn_hash)
            ))
            .send()
            .await?;
        if response.status().as_u16() == 400 || response.status().as_u16() == 404 {
            return Ok(Confirmation::Pending);
        }
        let body: ConfirmationResponse =
            Self::handle_response(response, ErrorKind::TransactionVerifyError).await?;
        Ok(match (body.confirmation, body.error) {
            (Some(c), _) if c.transaction_status == 1 => Confirmation::Confirmed,
            (Some(c), _) => Confirmation::Rejected {
                reason: c.transaction_output,
            },
            (None, Some(reason)) => Confirmation::Rejected { reason },
            (None, None) => Confirmation::Pending,
        })
    }

    pub async fn allocation(&self, allocation_id: &str) -> Result<Allocation> {
        let mut last_error = Error::not_initialized("no sharders configured");
        for sharder in &self.sharders {
            let url = format!(
                "{}/v1/screst/{}/allocation?allocation={}",
                sharder,
                self.storage_sc_address,
                urlencoding::encode(allocation_id)
            );
            match self.client.get(url).send().await {
                Ok(response) => {
                    match Self::handle_response(response, ErrorKind::TransientRpc).await {
                        Ok(allocation) => return Ok(allocation),
                        Err(e) => last_error = e,
                    }
                }
                Err(e) => last_error = e.into(),
            }
        }
        Err(last_error)
    }
}

impl ChainFacade for HttpChain {
    async fn submit(&self, txn: &Transaction) -> Result<()> {
        self.submit(txn).await
    }
    fn sharder_count(&self) -> usize {
        self.sharders.len()
    }
    async fn query_confirmation(&self, sharder: usize, txn_hash: &str) -> Result<Confirmation> {
        self.query_confirmation(sharder, txn_hash).await
    }
    async fn allocation(&self, allocation_id: &str) -> Result<Allocation> {
        self.allocation(allocation_id).await
    }
}
