use std::sync::Arc;

use crate::{
    cache::BlockCache,
    config::SdkConfig,
    crypto::Credentials,
    error::{Error, Result},
    events::EventBus,
    fs::FileSystem,
    progress::ProgressStore,
};

/// Everything an entry point needs, passed explicitly. The block cache
/// lives and dies with the context.
#[derive(Clone)]
pub struct CoreContext {
    pub credentials: Credentials,
    pub fs: Arc<dyn FileSystem>,
    pub progress: ProgressStore,
    pub cache: BlockCache,
    pub events: EventBus,
    pub encryption_key: Option<[u8; 32]>,
    pub config: SdkConfig,
}

impl std::fmt::Debug for CoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreContext")
            .field("credentials", &self.credentials)
            .field("durable_progress", &self.progress.is_durable())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CoreContext {
    pub fn new(
        credentials: Option<Credentials>,
        fs: Arc<dyn FileSystem>,
        config: SdkConfig,
    ) -> Result<Self> {
        let credentials =
            credentials.ok_or_else(|| Error::not_initialized("no client credentials configured"))?;
        if config.chunk_size == 0 || config.prefetch == 0 || config.window_blocks == 0 {
            return Err(Error::invalid_parameter(
                "chunk size, prefetch and window must be positive",
            ));
        }
        Ok(Self {
            credentials,
            progress: ProgressStore::new(fs.clone()),
            cache: BlockCache::new(config.block_cache_capacity),
            events: EventBus::new(),
            encryption_key: None,
            fs,
            config,
        })
    }

    pub fn with_encryption_key(mut self, key: [u8; 32]) -> Self {
        self.encryption_key = Some(key);
        self
    }

    pub fn client_id(&self) -> &str {
        &self.credentials.client_id
    }
}
