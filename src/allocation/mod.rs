mod context;
mod operations;
mod repair;

use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::warn;

use crate::{
    consensus::{read_quorum, write_quorum},
    error::{Error, ErrorKind, Result},
    marker::FileOp,
};

pub use context::AllocationContext;
pub use operations::{
    DownloadOptions, FileStats, MultiOperation, OperationResult, UploadOptions,
};
pub use repair::RepairReport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobberNode {
    pub id: String,
    pub base_url: String,
    #[serde(default)]
    pub weight: u64,
    #[serde(default)]
    pub last_health: Option<i64>,
}

pub const FORBID_UPLOAD: u16 = 1;
pub const FORBID_DELETE: u16 = 2;
pub const FORBID_UPDATE: u16 = 4;
pub const FORBID_MOVE: u16 = 8;
pub const FORBID_COPY: u16 = 16;
pub const FORBID_RENAME: u16 = 32;
const KNOWN_BITS: u16 = FORBID_UPLOAD
    | FORBID_DELETE
    | FORBID_UPDATE
    | FORBID_MOVE
    | FORBID_COPY
    | FORBID_RENAME;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOptions {
    pub mask: u16,
    #[serde(default)]
    pub third_party_extendable: bool,
}

impl FileOptions {
    pub fn forbid_bit(op: FileOp) -> u16 {
        match op {
            FileOp::Upload | FileOp::CreateDir => FORBID_UPLOAD,
            FileOp::Update => FORBID_UPDATE,
            FileOp::Delete => FORBID_DELETE,
            FileOp::Move => FORBID_MOVE,
            FileOp::Copy => FORBID_COPY,
            FileOp::Rename => FORBID_RENAME,
        }
    }

    /// Unknown bits deny every write.
    pub fn check(&self, op: FileOp, is_owner: bool) -> Result<()> {
        if self.mask & !KNOWN_BITS != 0 {
            return Err(Error::invalid_parameter(format!(
                "allocation carries unknown file option bits {:#x}",
                self.mask & !KNOWN_BITS
            )));
        }
        if self.mask & Self::forbid_bit(op) != 0 {
            return Err(Error::invalid_parameter(format!(
                "{} is forbidden on this allocation",
                op
            )));
        }
        if !is_owner && !(self.third_party_extendable && op == FileOp::Upload) {
            return Err(Error::new(
                ErrorKind::Unauthorized,
                format!("only the owner may {} on this allocation", op),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AllocationStatus {
    #[default]
    Active,
    Frozen,
    Cancelled,
    Expired,
}

impl AllocationStatus {
    pub fn can_transition(self, next: AllocationStatus) -> bool {
        use AllocationStatus::*;
        self == next
            || matches!(
                (self, next),
                (Active, Frozen) | (Active, Cancelled) | (Active, Expired)
                    | (Frozen, Cancelled) | (Frozen, Expired)
            )
    }
}

/// Allocation header as issued by the chain. Immutable for the core apart
/// from its status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
    pub data_shards: usize,
    pub parity_shards: usize,
    pub size: u64,
    /// Unix seconds; zero never expires.
    pub expiration: i64,
    pub owner_id: String,
    pub owner_public_key: String,
    #[serde(default)]
    pub read_price: u64,
    #[serde(default)]
    pub write_price: u64,
    #[serde(default)]
    pub file_options: FileOptions,
    pub blobbers: Vec<BlobberNode>,
    #[serde(default)]
    pub status: AllocationStatus,
}

impl Allocation {
    pub fn validate(&self) -> Result<()> {
        if self.data_shards == 0 {
            return Err(Error::invalid_parameter("allocation has no data shards"));
        }
        if self.blobbers.len() != self.data_shards + self.parity_shards {
            return Err(Error::invalid_parameter(format!(
                "allocation lists {} blobbers for {}+{} shards",
                self.blobbers.len(),
                self.data_shards,
                self.parity_shards
            )));
        }
        Ok(())
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    pub fn read_quorum(&self) -> usize {
        read_quorum(self.data_shards)
    }

    pub fn write_quorum(&self) -> usize {
        write_quorum(self.data_shards, self.parity_shards)
    }

    pub fn blobber_ids(&self) -> Vec<String> {
        self.blobbers.iter().map(|b| b.id.clone()).collect()
    }

    pub fn effective_status(&self, now: i64) -> AllocationStatus {
        match self.status {
            AllocationStatus::Active | AllocationStatus::Frozen
                if self.expiration > 0 && self.expiration < now =>
            {
                AllocationStatus::Expired
            }
            status => status,
        }
    }

    /// Applies a status reported by the chain. Illegal transitions are
    /// logged and ignored.
    pub fn apply_status(&mut self, next: AllocationStatus) -> bool {
        if self.status.can_transition(next) {
            self.status = next;
            true
        } else {
            warn!(
                "Ignoring allocation {} transition {} -> {}",
                self.id, self.status, next
            );
            false
        }
    }

    pub fn check_read(&self, now: i64) -> Result<()> {
        match self.effective_status(now) {
            AllocationStatus::Active | AllocationStatus::Frozen => Ok(()),
            status => Err(Error::invalid_parameter(format!(
                "allocation {} is {}",
                self.id, status
            ))),
        }
    }

    pub fn check_write(&self, op: FileOp, client_id: &str, now: i64) -> Result<()> {
        let status = self.effective_status(now);
        if status != AllocationStatus::Active {
            return Err(Error::invalid_parameter(format!(
                "allocation {} is {}",
                self.id, status
            )));
        }
        self.file_options.check(op, client_id == self.owner_id)
    }
}
