//! Signed records exchanged with blobbers: write markers that commit a
//! batch of staged changes, and auth tickets that grant read access.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    crypto::{Credentials, hash_hex},
    error::{Error, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FileOp {
    Upload,
    Update,
    Rename,
    Copy,
    Move,
    Delete,
    CreateDir,
}

impl FileOp {
    pub fn is_metadata_only(self) -> bool {
        !matches!(self, FileOp::Upload | FileOp::Update)
    }
}

/// One staged change as both sides see it. The JSON encoding of the ordered
/// list of these is what the allocation root commits to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub operation: FileOp,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_path: Option<String>,
    /// Plaintext size delta of the change.
    pub size: i64,
    /// Column root of the blobber's shards for uploads, empty otherwise.
    #[serde(default)]
    pub content_root: String,
}

pub fn change_hash(changes: &[ChangeRecord]) -> Result<String> {
    Ok(hash_hex(serde_json::to_vec(changes)?))
}

pub fn next_allocation_root(prev_root: &str, change_hash: &str, timestamp: i64) -> String {
    hash_hex(format!("{}:{}:{}", prev_root, change_hash, timestamp))
}

/// Genesis allocation root of a blobber that has never committed.
pub fn empty_allocation_root(allocation_id: &str, blobber_id: &str) -> String {
    hash_hex(format!("{}:{}:genesis", allocation_id, blobber_id))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteMarker {
    pub allocation_root: String,
    pub prev_allocation_root: String,
    pub allocation_id: String,
    pub blobber_id: String,
    pub client_id: String,
    pub size: i64,
    pub timestamp: i64,
    pub operation: String,
    #[serde(default)]
    pub signature: String,
}

impl WriteMarker {
    pub fn canonical(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}:{}",
            self.allocation_root,
            self.prev_allocation_root,
            self.allocation_id,
            self.blobber_id,
            self.client_id,
            self.size,
            self.timestamp,
            self.operation
        )
    }

    pub fn signing_hash(&self) -> String {
        hash_hex(self.canonical())
    }

    pub fn sign(mut self, credentials: &Credentials) -> Result<Self> {
        self.signature = credentials.sign(&self.signing_hash())?;
        Ok(self)
    }

    pub fn verify(&self, credentials: &Credentials, public_key: &str) -> Result<bool> {
        credentials.verify(public_key, &self.signing_hash(), &self.signature)
    }

    /// Structural checks a blobber applies before looking at its own state.
    pub fn validate(&self, allocation_id: &str, blobber_id: &str) -> Result<()> {
        if self.allocation_id != allocation_id {
            return Err(Error::marker_rejected(format!(
                "marker is for allocation {}, expected {}",
                self.allocation_id, allocation_id
            )));
        }
        if self.blobber_id != blobber_id {
            return Err(Error::marker_rejected(format!(
                "marker is for blobber {}, expected {}",
                self.blobber_id, blobber_id
            )));
        }
        if self.signature.is_empty() {
            return Err(Error::marker_rejected("marker is unsigned"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum ReferenceType {
    #[serde(rename = "f")]
    #[strum(serialize = "f")]
    File,
    #[serde(rename = "d")]
    #[strum(serialize = "d")]
    Directory,
}

/// Capability granting a non-owner read access to one file or directory.
/// Travels as base64 of its JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTicket {
    /// Referee the ticket is bound to; empty means any bearer.
    pub client_id: String,
    pub owner_id: String,
    pub allocation_id: String,
    pub file_path_hash: String,
    pub actual_file_hash: String,
    pub file_name: String,
    pub reference_type: ReferenceType,
    /// Unix seconds; zero never expires.
    pub expiration: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_public_key: Option<String>,
    #[serde(default)]
    pub signature: String,
}

impl AuthTicket {
    pub fn canonical(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{}",
            self.client_id,
            self.owner_id,
            self.allocation_id,
            self.file_path_hash,
            self.actual_file_hash,
            self.file_name,
            self.reference_type,
            self.expiration,
            self.encryption_public_key.as_deref().unwrap_or("")
        )
    }

    pub fn sign(mut self, credentials: &Credentials) -> Result<Self> {
        self.signature = credentials.sign(&hash_hex(self.canonical()))?;
        Ok(self)
    }

    pub fn verify(&self, credentials: &Credentials, owner_public_key: &str) -> Result<bool> {
        credentials.verify(owner_public_key, &hash_hex(self.canonical()), &self.signature)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(BASE64.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::auth_ticket(format!("ticket is not base64: {}", e)).with_cause(e))?;
        let ticket: AuthTicket = serde_json::from_slice(&bytes)
            .map_err(|e| Error::auth_ticket(format!("ticket is not valid JSON: {}", e)).with_cause(e))?;
        if ticket.signature.is_empty() {
            return Err(Error::auth_ticket("ticket is unsigned"));
        }
        Ok(ticket)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expiration > 0 && self.expiration < now
    }

    /// Expiry and referee checks shared by the client and blobbers.
    pub fn check(&self, now: i64, bearer_client_id: Option<&str>) -> Result<()> {
        if self.is_expired(now) {
            return Err(Error::auth_ticket(format!(
                "ticket expired at {}",
                self.expiration
            )));
        }
        if !self.client_id.is_empty() && bearer_client_id != Some(self.client_id.as_str()) {
            return Err(Error::auth_ticket("ticket is bound to another client"));
        }
        Ok(())
    }
}

pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
