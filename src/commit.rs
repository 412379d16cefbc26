use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    chain::{ChainFacade, Confirmation, SmartContractCall, Transaction},
    codec::merkle_root_hex,
    config::SdkConfig,
    crypto::Credentials,
    error::{Error, ErrorKind, Result},
    marker::WriteMarker,
    retry::{new_backoff, retry},
};

pub const COMMIT_FUNCTION: &str = "commit_connection";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitPayload {
    pub allocation_id: String,
    pub root_after: String,
    pub write_markers: Vec<WriteMarker>,
}

/// Binds a set of write markers to one smart-contract transaction. The
/// transaction hash depends only on the markers, so resubmitting the same
/// set is a no-op on chain.
#[derive(Clone)]
pub struct CommitBinder<C> {
    chain: C,
    credentials: Credentials,
    storage_sc_address: String,
    config: SdkConfig,
}

impl<C: ChainFacade> CommitBinder<C> {
    pub fn new(
        chain: C,
        credentials: Credentials,
        storage_sc_address: impl Into<String>,
        config: SdkConfig,
    ) -> Self {
        Self {
            chain,
            credentials,
            storage_sc_address: storage_sc_address.into(),
            config,
        }
    }

    pub fn transaction(&self, allocation_id: &str, markers: &[WriteMarker]) -> Result<Transaction> {
        if markers.is_empty() {
            return Err(Error::invalid_parameter("nothing to commit"));
        }
        let roots: Vec<&str> = markers.iter().map(|m| m.allocation_root.as_str()).collect();
        let payload = SmartContractCall {
            name: COMMIT_FUNCTION.to_string(),
            input: CommitPayload {
                allocation_id: allocation_id.to_string(),
                root_after: merkle_root_hex(&roots)
                    .ok_or_else(|| Error::invalid_parameter("malformed allocation root"))?,
                write_markers: markers.to_vec(),
            },
        };
        let creation_date = markers.iter().map(|m| m.timestamp).max().unwrap_or_default();
        Transaction::smart_contract(
            &self.credentials,
            &self.storage_sc_address,
            serde_json::to_string(&payload)?,
            creation_date,
        )
        .sign(&self.credentials)
    }

    pub async fn commit(
        &self,
        allocation_id: &str,
        markers: &[WriteMarker],
        cancel: CancellationToken,
    ) -> Result<String> {
        let txn = self.transaction(allocation_id, markers)?;
        info!("Submitting commit {} for allocation {}", txn.hash, allocation_id);
        let (chain, signed) = (&self.chain, &txn);
        retry(
            || async move {
                chain.submit(signed).await.map_err(|e| match e.kind() {
                    ErrorKind::TransactionSendError => e,
                    _ => Error::new(ErrorKind::TransactionSendError, e.message().to_string())
                        .with_cause(e),
                })
            },
            "submit commit",
            new_backoff(&self.config.retry),
            cancel.clone(),
        )
        .await?;
        self.await_confirmation(&txn.hash, cancel).await?;
        info!("Commit {} confirmed", txn.hash);
        Ok(txn.hash)
    }

    fn required_confirmations(&self) -> usize {
        let sharders = self.chain.sharder_count();
        (sharders * self.config.min_confirmation as usize)
            .div_ceil(100)
            .clamp(1, sharders.max(1))
    }

    pub async fn await_confirmation(&self, txn_hash: &str, cancel: CancellationToken) -> Result<()> {
        let required = self.required_confirmations();
        let mut last_reason = String::new();
        for attempt in 0..self.config.max_txn_query.max(1) {
            if attempt > 0 {
                select! {
                    _ = cancel.cancelled() => return Err(Error::cancelled()),
                    _ = sleep(self.config.query_sleep_time) => {}
                }
            }
            let answers = join_all(
                (0..self.chain.sharder_count()).map(|i| self.chain.query_confirmation(i, txn_hash)),
            )
            .await;
            let mut confirmed = 0;
            let mut rejected = 0;
            for answer in answers {
                match answer {
                    Ok(Confirmation::Confirmed) => confirmed += 1,
                    Ok(Confirmation::Rejected { reason }) => {
                        rejected += 1;
                        last_reason = reason;
                    }
                    Ok(Confirmation::Pending) => {}
                    Err(e) => debug!("Confirmation query for {} failed: {}", txn_hash, e),
                }
            }
            debug!(
                "Commit {} attempt {}: {} confirmed, {} rejected, {} required",
                txn_hash, attempt, confirmed, rejected, required
            );
            if confirmed >= required {
                return Ok(());
            }
            if rejected >= required {
                warn!("Commit {} rejected: {}", txn_hash, last_reason);
                return Err(Error::new(
                    ErrorKind::TransactionVerifyError,
                    format!("transaction {} rejected: {}", txn_hash, last_reason),
                ));
            }
        }
        Err(Error::new(
            ErrorKind::TransactionVerifyError,
            format!(
                "transaction {} not confirmed by {} sharders after {} queries",
                txn_hash, required, self.config.max_txn_query
            ),
        ))
    }
}
