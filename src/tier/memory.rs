//! In-process L2.
//!
//! Several providers can share one [`MemoryStore`], which makes it a stand-in
//! for a networked store when more than one node lives in the same process.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Level2Cache, Level2Provider, clamp_ttl};
use crate::config::Properties;
use crate::CacheError;

struct StoredBytes {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredBytes {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

type RegionMap = DashMap<String, StoredBytes>;

/// Shared backing map, cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryStore {
    regions: Arc<DashMap<String, Arc<RegionMap>>>,
    reads: Arc<AtomicUsize>,
    down: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of key lookups served so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Simulate an outage: every call fails with `BackendUnavailable` while down.
    pub fn set_available(&self, available: bool) {
        self.down.store(!available, Ordering::SeqCst);
    }

    fn region(&self, name: &str) -> Arc<RegionMap> {
        Arc::clone(
            self.regions
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(DashMap::new()))
                .value(),
        )
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(CacheError::unavailable("memory store is down"));
        }
        Ok(())
    }
}

/// One region of a [`MemoryStore`].
pub struct MemoryLevel2 {
    store: MemoryStore,
    entries: Arc<RegionMap>,
    supports_ttl: bool,
}

impl MemoryLevel2 {
    fn read(&self, key: &str) -> Option<Vec<u8>> {
        self.store.reads.fetch_add(1, Ordering::SeqCst);
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(stored) if !stored.is_expired(now) => return Some(stored.bytes.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, stored| stored.is_expired(now));
        }
        None
    }

    fn write(&self, key: String, bytes: Vec<u8>, ttl_seconds: u64) {
        let expires_at = (self.supports_ttl && ttl_seconds > 0)
            .then(|| Instant::now() + Duration::from_secs(clamp_ttl(ttl_seconds)));
        self.entries.insert(key, StoredBytes { bytes, expires_at });
    }
}

#[async_trait]
impl Level2Cache for MemoryLevel2 {
    fn supports_ttl(&self) -> bool {
        self.supports_ttl
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.store.check()?;
        Ok(self.read(key))
    }

    async fn get_many_bytes(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        self.store.check()?;
        Ok(keys.iter().map(|k| self.read(k)).collect())
    }

    async fn set_bytes(
        &self,
        key: &str,
        bytes: Vec<u8>,
        ttl_seconds: u64,
    ) -> Result<(), CacheError> {
        self.store.check()?;
        self.write(key.to_owned(), bytes, ttl_seconds);
        Ok(())
    }

    async fn set_many_bytes(
        &self,
        values: HashMap<String, Vec<u8>>,
        ttl_seconds: u64,
    ) -> Result<(), CacheError> {
        self.store.check()?;
        for (key, bytes) in values {
            self.write(key, bytes, ttl_seconds);
        }
        Ok(())
    }

    async fn keys(&self) -> Result<HashSet<String>, CacheError> {
        self.store.check()?;
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn evict(&self, keys: &[String]) -> Result<(), CacheError> {
        self.store.check()?;
        for key in keys {
            self.entries.remove(key);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.store.check()?;
        self.entries.clear();
        Ok(())
    }
}

/// Provider over a (possibly shared) [`MemoryStore`].
///
/// Property `ttl = true|false` (default true) decides whether writes honour
/// their TTL.
pub struct MemoryLevel2Provider {
    store: MemoryStore,
    supports_ttl: bool,
}

impl MemoryLevel2Provider {
    pub fn new(store: MemoryStore, supports_ttl: bool) -> Self {
        Self {
            store,
            supports_ttl,
        }
    }

    pub fn from_properties(props: &Properties) -> Result<Self, CacheError> {
        Ok(Self::new(MemoryStore::new(), props.bool_or("ttl", true)?))
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

#[async_trait]
impl Level2Provider for MemoryLevel2Provider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn build_cache(&self, region: &str) -> Result<Arc<dyn Level2Cache>, CacheError> {
        Ok(Arc::new(MemoryLevel2 {
            store: self.store.clone(),
            entries: self.store.region(region),
            supports_ttl: self.supports_ttl,
        }))
    }

    async fn stop(&self) {}
}
