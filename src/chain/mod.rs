pub mod client;

use serde::{Deserialize, Serialize};

use crate::{
    allocation::Allocation,
    crypto::{Credentials, hash_hex},
    error::Result,
};

pub use client::HttpChain;

pub const TXN_VERSION: &str = "1.0";
pub const TXN_TYPE_SMART_CONTRACT: i32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub version: String,
    pub client_id: String,
    pub public_key: String,
    pub to_client_id: String,
    pub value: i64,
    pub transaction_data: String,
    pub transaction_type: i32,
    pub creation_date: i64,
    pub signature: String,
    pub fee: i64,
}

impl Transaction {
    pub fn smart_contract(
        credentials: &Credentials,
        to_client_id: &str,
        transaction_data: String,
        creation_date: i64,
    ) -> Self {
        let mut txn = Self {
            hash: String::new(),
            version: TXN_VERSION.to_string(),
            client_id: credentials.client_id.clone(),
            public_key: credentials.public_key.clone(),
            to_client_id: to_client_id.to_string(),
            value: 0,
            transaction_data,
            transaction_type: TXN_TYPE_SMART_CONTRACT,
            creation_date,
            signature: String::new(),
            fee: 0,
        };
        txn.hash = txn.compute_hash();
        txn
    }

    pub fn compute_hash(&self) -> String {
        hash_hex(format!(
            "{}:{}:{}:{}:{}",
            self.creation_date,
            self.client_id,
            self.to_client_id,
            self.value,
            hash_hex(&self.transaction_data)
        ))
    }

    pub fn sign(mut self, credentials: &Credentials) -> Result<Self> {
        self.hash = self.compute_hash();
        self.signature = credentials.sign(&self.hash)?;
        Ok(self)
    }

    pub fn verify(&self, credentials: &Credentials) -> Result<bool> {
        if self.hash != self.compute_hash() {
            return Ok(false);
        }
        credentials.verify(&self.public_key, &self.hash, &self.signature)
    }
}

/// Smart-contract call carried in `transaction_data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartContractCall<T> {
    pub name: String,
    pub input: T,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Confirmation {
    Confirmed,
    Pending,
    Rejected { reason: String },
}

/// What the core needs from the blockchain.
pub trait ChainFacade: Send + Sync + Clone + 'static {
    fn submit(&self, txn: &Transaction) -> impl Future<Output = Result<()>> + Send;

    fn sharder_count(&self) -> usize;

    fn query_confirmation(
        &self,
        sharder: usize,
        txn_hash: &str,
    ) -> impl Future<Output = Result<Confirmation>> + Send;

    fn allocation(&self, allocation_id: &str) -> impl Future<Output = Result<Allocation>> + Send;
}
