use std::{fmt, sync::Arc};

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub type HashBytes = [u8; 32];

pub type SignFn = Arc<dyn Fn(&str) -> Result<String> + Send + Sync>;
pub type VerifyFn = Arc<dyn Fn(&str, &str, &str) -> Result<bool> + Send + Sync>;
pub type AuthorizeFn = Arc<dyn Fn(&str) -> Result<String> + Send + Sync>;

pub fn hash(data: impl AsRef<[u8]>) -> HashBytes {
    Sha256::digest(data.as_ref()).into()
}

pub fn hash_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(hash(data))
}

/// `H(a ∥ b ∥ ...)` over raw byte parts.
pub fn hash_parts<I, T>(parts: I) -> HashBytes
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref());
    }
    hasher.finalize().into()
}

pub fn lookup_hash(allocation_id: &str, path: &str) -> String {
    hash_hex(format!("{}:{}", allocation_id, path))
}

/// Signer, verifier and authorizer supplied by the host, plus the identity
/// they act for. The core never reaches for key material on its own.
#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub public_key: String,
    pub sign: SignFn,
    pub verify: VerifyFn,
    pub authorize: AuthorizeFn,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    pub fn ed25519(signing_key: SigningKey) -> Self {
        let public_key = hex::encode(signing_key.verifying_key().to_bytes());
        let client_id = client_id_for(&public_key);
        let key = Arc::new(signing_key);
        let sign: SignFn = {
            let key = key.clone();
            Arc::new(move |msg: &str| Ok(hex::encode(key.sign(msg.as_bytes()).to_bytes())))
        };
        let authorize: AuthorizeFn = {
            let key = key.clone();
            let client_id = client_id.clone();
            Arc::new(move |msg: &str| {
                let signature = hex::encode(key.sign(msg.as_bytes()).to_bytes());
                Ok(format!("{}:{}", client_id, signature))
            })
        };
        Self {
            client_id,
            public_key,
            sign,
            verify: Arc::new(verify_ed25519),
            authorize,
        }
    }

    pub fn generate() -> Self {
        Self::ed25519(SigningKey::generate(&mut rand::rngs::OsRng))
    }

    pub fn sign(&self, msg: &str) -> Result<String> {
        (self.sign)(msg)
    }

    pub fn verify(&self, public_key: &str, msg: &str, signature: &str) -> Result<bool> {
        (self.verify)(public_key, msg, signature)
    }

    pub fn authorize(&self, msg: &str) -> Result<String> {
        (self.authorize)(msg)
    }
}

pub fn client_id_for(public_key_hex: &str) -> String {
    match hex::decode(public_key_hex) {
        Ok(bytes) => hash_hex(bytes),
        Err(_) => hash_hex(public_key_hex),
    }
}

pub fn verify_ed25519(public_key: &str, msg: &str, signature: &str) -> Result<bool> {
    let key_bytes: [u8; 32] = hex::decode(public_key)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::invalid_parameter("malformed public key"))?;
    let sig_bytes: [u8; 64] = match hex::decode(signature).ok().and_then(|b| b.try_into().ok()) {
        Some(bytes) => bytes,
        None => return Ok(false),
    };
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| Error::invalid_parameter(format!("invalid public key: {}", e)))?;
    Ok(key
        .verify(msg.as_bytes(), &Signature::from_bytes(&sig_bytes))
        .is_ok())
}

/// On-disk wallet: hex encoded ed25519 key pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub client_id: String,
    pub public_key: String,
    pub private_key: String,
}

impl Wallet {
    pub fn generate() -> Self {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let public_key = hex::encode(key.verifying_key().to_bytes());
        Self {
            client_id: client_id_for(&public_key),
            public_key,
            private_key: hex::encode(key.to_bytes()),
        }
    }

    pub fn credentials(&self) -> Result<Credentials> {
        let secret: [u8; 32] = hex::decode(&self.private_key)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::not_initialized("wallet private key is malformed"))?;
        let credentials = Credentials::ed25519(SigningKey::from_bytes(&secret));
        if credentials.public_key != self.public_key {
            return Err(Error::not_initialized(
                "wallet public key does not match private key",
            ));
        }
        Ok(credentials)
    }
}
