use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{Arc, Mutex},
};

use lru::LruCache;
use scopeguard::defer;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::error::{Error, Result};

pub const DEFAULT_BLOCK_CACHE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub lookup_hash: String,
    /// Validation root of the object version the window belongs to.
    pub version: String,
    pub start_block: u64,
    pub end_block: u64,
    pub window: u64,
}

/// Reconstructed plaintext windows. Lookups share the LRU under a short
/// lock; a miss takes an exclusive per-key lock so that concurrent readers
/// of the same window fetch it once.
#[derive(Clone)]
pub struct BlockCache {
    entries: Arc<Mutex<LruCache<BlockKey, Arc<Vec<u8>>>>>,
    inflight: Arc<Mutex<HashMap<BlockKey, Arc<AsyncMutex<()>>>>>,
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_CACHE_CAPACITY)
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::internal("block cache lock poisoned")
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
            inflight: Arc::default(),
        }
    }

    pub fn get(&self, key: &BlockKey) -> Option<Arc<Vec<u8>>> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    pub fn put(&self, key: BlockKey, bytes: Arc<Vec<u8>>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(key, bytes);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every window of one file.
    pub fn invalidate(&self, lookup_hash: &str) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        let stale: Vec<BlockKey> = entries
            .iter()
            .filter(|(k, _)| k.lookup_hash == lookup_hash)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        if !stale.is_empty() {
            debug!("Invalidated {} cached windows of {}", stale.len(), lookup_hash);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub async fn get_or_fetch<F, Fut>(&self, key: BlockKey, fetch: F) -> Result<Arc<Vec<u8>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        if let Some(hit) = self.get(&key) {
            debug!("Block cache hit {:?}", key);
            return Ok(hit);
        }
        let key_lock = self
            .inflight
            .lock()
            .map_err(poisoned)?
            .entry(key.clone())
            .or_default()
            .clone();
        let _key_guard = key_lock.lock().await;
        defer! {
            if let Ok(mut inflight) = self.inflight.lock() {
                if inflight.get(&key).is_some_and(|l| Arc::strong_count(l) <= 2) {
                    inflight.remove(&key);
                }
            }
        }
        if let Some(hit) = self.get(&key) {
            return Ok(hit);
        }
        let bytes = Arc::new(fetch().await?);
        self.put(key.clone(), bytes.clone());
        Ok(bytes)
    }
}
