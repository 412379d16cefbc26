use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::{
    crypto::{hash_hex, hash_parts},
    error::{Error, Result},
};

pub const TAG_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;

/// Per-allocation symmetric key. Every blobber column gets its own key
/// `K_i = HKDF(key, salt = allocationID, info = blobberID_i)`.
#[derive(Clone)]
pub struct ShardCipher {
    allocation_id: String,
    /// Nonces are bound to the plaintext digest so that renamed and copied
    /// objects stay readable.
    content_hash: String,
    keys: Vec<[u8; 32]>,
}

impl std::fmt::Debug for ShardCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardCipher")
            .field("allocation_id", &self.allocation_id)
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

pub fn derive_shard_key(key: &[u8; 32], allocation_id: &str, blobber_id: &str) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(allocation_id.as_bytes()), key);
    let mut out = [0u8; 32];
    hk.expand(blobber_id.as_bytes(), &mut out)
        .map_err(|e| Error::internal(format!("key derivation failed: {}", e)))?;
    Ok(out)
}

/// Public tag stored with an encrypted object so that readers can tell
/// whether they hold the right key without revealing it.
pub fn key_fingerprint(key: &[u8; 32], allocation_id: &str) -> String {
    hash_hex([b"shardbox-key:".as_slice(), allocation_id.as_bytes(), key.as_slice()].concat())
}

fn nonce_for(allocation_id: &str, content_hash: &str, chunk_index: u64, shard_index: usize) -> [u8; NONCE_SIZE] {
    let digest = hash_parts([
        allocation_id.as_bytes(),
        content_hash.as_bytes(),
        chunk_index.to_be_bytes().as_slice(),
        (shard_index as u64).to_be_bytes().as_slice(),
    ]);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&digest[..NONCE_SIZE]);
    nonce
}

impl ShardCipher {
    pub fn new(
        key: &[u8; 32],
        allocation_id: &str,
        content_hash: &str,
        blobber_ids: &[String],
    ) -> Result<Self> {
        let keys = blobber_ids
            .iter()
            .map(|id| derive_shard_key(key, allocation_id, id))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            allocation_id: allocation_id.to_string(),
            content_hash: content_hash.to_string(),
            keys,
        })
    }

    fn cipher(&self, shard_index: usize) -> Result<Aes256Gcm> {
        let key = self
            .keys
            .get(shard_index)
            .ok_or_else(|| Error::invalid_parameter(format!("no key for shard {}", shard_index)))?;
        Aes256Gcm::new_from_slice(key)
            .map_err(|e| Error::internal(format!("cipher init failed: {}", e)))
    }

    pub fn encrypt(&self, chunk_index: u64, shard_index: usize, shard: &[u8]) -> Result<Vec<u8>> {
        let nonce = nonce_for(&self.allocation_id, &self.content_hash, chunk_index, shard_index);
        self.cipher(shard_index)?
            .encrypt(Nonce::from_slice(&nonce), shard)
            .map_err(|e| Error::internal(format!("shard encryption failed: {}", e)))
    }

    pub fn decrypt(&self, chunk_index: u64, shard_index: usize, sealed: &[u8]) -> Result<Vec<u8>> {
        let nonce = nonce_for(&self.allocation_id, &self.content_hash, chunk_index, shard_index);
        self.cipher(shard_index)?
            .decrypt(Nonce::from_slice(&nonce), sealed)
            .map_err(|_| {
                Error::corrupted_shards(format!(
                    "shard {} of chunk {} failed authentication",
                    shard_index, chunk_index
                ))
            })
    }
}
