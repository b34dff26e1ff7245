//! Stores that hold nothing, usable at either level.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use super::{ExpirationListener, Level1Cache, Level1Provider, Level2Cache, Level2Provider};
use crate::entry::{CachedValue, Region};
use crate::CacheError;

pub struct NullCache;

#[async_trait]
impl Level1Cache for NullCache {
    async fn get(&self, _key: &str) -> Result<Option<CachedValue>, CacheError> {
        Ok(None)
    }

    async fn get_many(&self, _keys: &[String]) -> Result<HashMap<String, CachedValue>, CacheError> {
        Ok(HashMap::new())
    }

    async fn put(&self, _key: &str, _value: CachedValue) -> Result<(), CacheError> {
        Ok(())
    }

    async fn put_many(&self, _values: HashMap<String, CachedValue>) -> Result<(), CacheError> {
        Ok(())
    }

    async fn keys(&self) -> Result<HashSet<String>, CacheError> {
        Ok(HashSet::new())
    }

    async fn evict(&self, _keys: &[String]) -> Result<(), CacheError> {
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        Ok(())
    }

    fn ttl_seconds(&self) -> u64 {
        0
    }

    fn capacity(&self) -> u64 {
        0
    }
}

#[async_trait]
impl Level2Cache for NullCache {
    async fn get_bytes(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(None)
    }

    async fn get_many_bytes(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        Ok(vec![None; keys.len()])
    }

    async fn set_bytes(&self, _key: &str, _bytes: Vec<u8>, _ttl: u64) -> Result<(), CacheError> {
        Ok(())
    }

    async fn set_many_bytes(
        &self,
        _values: HashMap<String, Vec<u8>>,
        _ttl: u64,
    ) -> Result<(), CacheError> {
        Ok(())
    }

    async fn keys(&self) -> Result<HashSet<String>, CacheError> {
        Ok(HashSet::new())
    }

    async fn evict(&self, _keys: &[String]) -> Result<(), CacheError> {
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// `"none"` provider for either level.
pub struct NullProvider;

#[async_trait]
impl Level1Provider for NullProvider {
    fn name(&self) -> &str {
        "none"
    }

    async fn build_cache(
        &self,
        _region: &str,
        _ttl_seconds: Option<u64>,
        _listener: ExpirationListener,
    ) -> Result<Arc<dyn Level1Cache>, CacheError> {
        Ok(Arc::new(NullCache))
    }

    fn regions(&self) -> Vec<Region> {
        Vec::new()
    }

    async fn stop(&self) {}
}

#[async_trait]
impl Level2Provider for NullProvider {
    fn name(&self) -> &str {
        "none"
    }

    async fn build_cache(&self, _region: &str) -> Result<Arc<dyn Level2Cache>, CacheError> {
        Ok(Arc::new(NullCache))
    }

    async fn stop(&self) {}
}
