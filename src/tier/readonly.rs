//! Read-only view over any L2 store.
//!
//! Reads pass through; writes, evictions and clears are skipped. Useful for
//! nodes that consume a shared store another system populates.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{Level2Cache, Level2Provider};
use crate::CacheError;

pub struct ReadonlyLevel2 {
    inner: Arc<dyn Level2Cache>,
}

impl ReadonlyLevel2 {
    pub fn new(inner: Arc<dyn Level2Cache>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Level2Cache for ReadonlyLevel2 {
    fn supports_ttl(&self) -> bool {
        self.inner.supports_ttl()
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.inner.get_bytes(key).await
    }

    async fn get_many_bytes(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        self.inner.get_many_bytes(keys).await
    }

    async fn set_bytes(&self, key: &str, _bytes: Vec<u8>, _ttl: u64) -> Result<(), CacheError> {
        debug!("Read-only L2: set [{}] skipped", key);
        Ok(())
    }

    async fn set_many_bytes(
        &self,
        values: HashMap<String, Vec<u8>>,
        _ttl: u64,
    ) -> Result<(), CacheError> {
        debug!("Read-only L2: set of {} keys skipped", values.len());
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.inner.exists(key).await
    }

    async fn keys(&self) -> Result<HashSet<String>, CacheError> {
        self.inner.keys().await
    }

    async fn evict(&self, keys: &[String]) -> Result<(), CacheError> {
        debug!("Read-only L2: evict [{}] skipped", keys.join(","));
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        debug!("Read-only L2: clear skipped");
        Ok(())
    }
}

/// Wraps every store another provider builds.
pub struct ReadonlyLevel2Provider {
    inner: Arc<dyn Level2Provider>,
}

impl ReadonlyLevel2Provider {
    pub fn new(inner: Arc<dyn Level2Provider>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Level2Provider for ReadonlyLevel2Provider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn build_cache(&self, region: &str) -> Result<Arc<dyn Level2Cache>, CacheError> {
        let inner = self.inner.build_cache(region).await?;
        Ok(Arc::new(ReadonlyLevel2::new(inner)))
    }

    async fn stop(&self) {
        self.inner.stop().await;
    }
}
