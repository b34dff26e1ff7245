//! Store contracts for both levels and the built-in backends.
//!
//! A provider owns the backend connection and hands out one store handle
//! per region. L1 stores hold [`CachedValue`]s in process; L2 stores hold
//! serialized bytes and are usually out of process.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::entry::{CachedValue, Region};
use crate::CacheError;

pub mod memory;
pub mod moka;
pub mod null;
pub mod readonly;
pub mod redis;

pub use self::memory::{MemoryLevel2Provider, MemoryStore};
pub use self::moka::MokaProvider;
pub use self::null::NullProvider;
pub use self::readonly::{ReadonlyLevel2, ReadonlyLevel2Provider};
pub use self::redis::RedisProvider;

/// `(region, key)` that an L1 backend dropped on its own expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredKey {
    pub region: String,
    pub key: String,
}

/// Sink L1 backends report autonomous expirations to.
///
/// Delivery is asynchronous: the registry's worker handles the event some
/// time after the backend expired the entry.
#[derive(Debug, Clone)]
pub struct ExpirationListener {
    tx: mpsc::Sender<ExpiredKey>,
}

impl ExpirationListener {
    pub fn new(tx: mpsc::Sender<ExpiredKey>) -> Self {
        Self { tx }
    }

    /// Called from backend eviction hooks, never blocks.
    pub fn notify_expired(&self, region: &str, key: &str) {
        let event = ExpiredKey {
            region: region.to_owned(),
            key: key.to_owned(),
        };
        if let Err(e) = self.tx.try_send(event) {
            warn!(
                "Dropped expiry notification for [{},{}]: {}",
                region, key, e
            );
        }
    }
}

/// Process-local store for one region.
#[async_trait]
pub trait Level1Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CachedValue>, CacheError>;

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, CachedValue>, CacheError>;

    async fn put(&self, key: &str, value: CachedValue) -> Result<(), CacheError>;

    async fn put_many(&self, values: HashMap<String, CachedValue>) -> Result<(), CacheError>;

    async fn keys(&self) -> Result<HashSet<String>, CacheError>;

    async fn evict(&self, keys: &[String]) -> Result<(), CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;

    /// Region TTL in seconds, 0 for none.
    fn ttl_seconds(&self) -> u64;

    /// Maximum element count.
    fn capacity(&self) -> u64;
}

/// Shared store for one region, byte oriented.
#[async_trait]
pub trait Level2Cache: Send + Sync {
    /// Whether entries expire on their own. When false the L1 expiry cascade
    /// evicts L1 a second time.
    fn supports_ttl(&self) -> bool {
        false
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// One slot per requested key, in request order.
    async fn get_many_bytes(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError>;

    /// `ttl_seconds == 0` stores without expiry.
    async fn set_bytes(&self, key: &str, bytes: Vec<u8>, ttl_seconds: u64)
    -> Result<(), CacheError>;

    async fn set_many_bytes(
        &self,
        values: HashMap<String, Vec<u8>>,
        ttl_seconds: u64,
    ) -> Result<(), CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.get_bytes(key).await?.is_some())
    }

    /// Not every shared store can enumerate.
    async fn keys(&self) -> Result<HashSet<String>, CacheError> {
        Err(CacheError::Unsupported("keys() on this level 2 store".to_owned()))
    }

    async fn evict(&self, keys: &[String]) -> Result<(), CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;
}

/// Owner of an L1 backend.
#[async_trait]
pub trait Level1Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Create-if-absent handle for `region`. `ttl_seconds` only applies when
    /// the region does not exist yet.
    async fn build_cache(
        &self,
        region: &str,
        ttl_seconds: Option<u64>,
        listener: ExpirationListener,
    ) -> Result<Arc<dyn Level1Cache>, CacheError>;

    /// Live regions.
    fn regions(&self) -> Vec<Region>;

    fn remove_cache(&self, _region: &str) {}

    async fn stop(&self);
}

/// Owner of an L2 backend.
#[async_trait]
pub trait Level2Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn build_cache(&self, region: &str) -> Result<Arc<dyn Level2Cache>, CacheError>;

    async fn stop(&self);
}

/// Longest TTL any backend is given, about 100 years.
pub(crate) const MAX_TTL_SECONDS: u64 = 100 * 365 * 86_400;

/// Cap `ttl_seconds` at [`MAX_TTL_SECONDS`].
pub(crate) fn clamp_ttl(ttl_seconds: u64) -> u64 {
    if ttl_seconds > MAX_TTL_SECONDS {
        warn!("TTL {}s capped at {}s", ttl_seconds, MAX_TTL_SECONDS);
        MAX_TTL_SECONDS
    } else {
        ttl_seconds
    }
}

/// Parse a TTL like `30m`, `1h`, `45s`, `2d` or a bare number of seconds.
pub(crate) fn parse_ttl_seconds(raw: &str) -> Result<u64, CacheError> {
    let raw = raw.trim().to_ascii_lowercase();
    let invalid = || CacheError::Config(format!("invalid ttl '{raw}'"));
    let (digits, unit) = match raw.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => (&raw[..idx], c),
        Some(_) => (raw.as_str(), 's'),
        None => return Err(invalid()),
    };
    let n: u64 = digits.trim().parse().map_err(|_| invalid())?;
    let factor = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86_400,
        _ => return Err(invalid()),
    };
    n.checked_mul(factor)
        .filter(|ttl| *ttl <= MAX_TTL_SECONDS)
        .ok_or_else(|| CacheError::Config(format!("ttl '{raw}' is too long")))
}
