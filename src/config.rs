use std::{path::PathBuf, time::Duration};

use bon::Builder;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::{codec::DEFAULT_CHUNK_SIZE, logging, retry::RetryPolicy};

#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[clap(
    author = "Shardbox",
    version = "0.1.0",
    about = "Shardbox",
    long_about = r#"Shardbox uploads and downloads erasure-coded files across a quorum of blobbers"#
)]
pub struct Config {
    #[clap(
        long,
        global = true,
        env = "LOG_FORMAT",
        help = "Log format (plain, json)",
        default_value = "plain"
    )]
    pub log_format: logging::Format,

    #[clap(
        long,
        global = true,
        env = "WALLET_PATH",
        help = "Path to the wallet JSON file holding the client key pair",
        default_value = "wallet.json"
    )]
    pub wallet_path: PathBuf,

    #[clap(
        long,
        global = true,
        env = "ALLOCATION_ID",
        help = "Allocation to operate on"
    )]
    pub allocation_id: Option<String>,

    #[clap(
        long,
        global = true,
        env = "ENCRYPTION_KEY",
        help = "Hex encoded 32-byte key for encrypted uploads and downloads",
        hide_env_values = true
    )]
    #[serde(skip_serializing)]
    pub encryption_key: Option<String>,

    #[clap(
        long,
        global = true,
        env = "SHARDER_URLS",
        help = "Comma separated sharder URLs (e.g., http://localhost:7171)",
        value_delimiter = ','
    )]
    pub sharder_urls: Vec<String>,

    #[clap(
        long,
        global = true,
        env = "MINER_URLS",
        help = "Comma separated miner URLs transactions are submitted to",
        value_delimiter = ','
    )]
    pub miner_urls: Vec<String>,

    #[clap(
        long,
        global = true,
        env = "STORAGE_SC_ADDRESS",
        help = "Address of the storage smart contract",
        default_value = "6dba10422e368813802877a85039d3985d96760ed844092319743fb3a76712d7"
    )]
    pub storage_sc_address: String,

    #[clap(
        long,
        global = true,
        env = "CHUNK_SIZE",
        help = "Plaintext chunk size in bytes",
        default_value_t = DEFAULT_CHUNK_SIZE
    )]
    pub chunk_size: usize,

    #[clap(
        long,
        global = true,
        env = "PREFETCH",
        help = "Encoded chunks buffered ahead of the slowest blobber",
        default_value = "3"
    )]
    pub prefetch: usize,

    #[clap(
        long,
        global = true,
        env = "WINDOW_BLOCKS",
        help = "Blocks fetched per download window",
        default_value = "10"
    )]
    pub window_blocks: u64,

    #[clap(
        long,
        global = true,
        env = "RPC_TIMEOUT_SECS",
        help = "Per-request timeout in seconds",
        default_value = "30"
    )]
    pub rpc_timeout_secs: u64,

    #[clap(
        long,
        global = true,
        env = "PROGRESS_DIR",
        help = "Directory upload progress records are persisted in",
        default_value = ".shardbox/progress"
    )]
    pub progress_dir: PathBuf,

    #[clap(
        long,
        global = true,
        env = "MIN_CONFIRMATION",
        help = "Percentage of sharders that must confirm a transaction",
        default_value = "50"
    )]
    pub min_confirmation: u8,

    #[clap(
        long,
        global = true,
        env = "MAX_TXN_QUERY",
        help = "Confirmation queries issued before giving up",
        default_value = "5"
    )]
    pub max_txn_query: usize,

    #[clap(
        long,
        global = true,
        env = "QUERY_SLEEP_SECS",
        help = "Seconds slept between confirmation queries",
        default_value = "5"
    )]
    pub query_sleep_secs: u64,

    #[clap(
        long,
        global = true,
        env = "API_PORT",
        help = "Port number for the streaming server (e.g., 8080)",
        default_value = "9444"
    )]
    pub api_port: u16,
}

impl Config {
    pub fn encryption_key(&self) -> crate::error::Result<Option<[u8; 32]>> {
        self.encryption_key
            .as_deref()
            .map(|key| {
                hex::decode(key.trim())
                    .ok()
                    .and_then(|bytes| bytes.try_into().ok())
                    .ok_or_else(|| crate::error::Error::invalid_parameter("encryption key must be 32 hex encoded bytes"))
            })
            .transpose()
    }

    pub fn sdk_config(&self) -> SdkConfig {
        SdkConfig::builder()
            .chunk_size(self.chunk_size)
            .prefetch(self.prefetch)
            .window_blocks(self.window_blocks)
            .rpc_timeout(Duration::from_secs(self.rpc_timeout_secs))
            .min_confirmation(self.min_confirmation)
            .max_txn_query(self.max_txn_query)
            .query_sleep_time(Duration::from_secs(self.query_sleep_secs))
            .build()
    }
}

/// Library tunables. Everything has a default; hosts override through the
/// builder.
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct SdkConfig {
    #[builder(default = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,
    #[builder(default = 3)]
    pub prefetch: usize,
    #[builder(default = 10)]
    pub window_blocks: u64,
    #[builder(default = Duration::from_secs(30))]
    pub rpc_timeout: Duration,
    /// Budget for one read window before outstanding fetches are abandoned.
    /// Defaults to three RPC timeouts.
    pub window_deadline: Option<Duration>,
    #[builder(default)]
    pub retry: RetryPolicy,
    #[builder(default = Duration::from_secs(300))]
    pub tree_ttl: Duration,
    #[builder(default = 1000)]
    pub block_cache_capacity: usize,
    #[builder(default = 50)]
    pub min_confirmation: u8,
    #[builder(default = 5)]
    pub max_txn_query: usize,
    #[builder(default = Duration::from_secs(5))]
    pub query_sleep_time: Duration,
    pub operation_timeout: Option<Duration>,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SdkConfig {
    pub fn chunk_budget(&self) -> Duration {
        self.rpc_timeout * 3
    }

    pub fn window_deadline(&self) -> Duration {
        self.window_deadline.unwrap_or_else(|| self.chunk_budget())
    }
}
