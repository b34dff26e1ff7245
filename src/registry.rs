//! Provider registry
//!
//! Owns the one L1 and one L2 provider of the process, hands out per-region
//! store handles and turns L1 expirations into L2 cleanup plus a cluster
//! eviction.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{OnceCell, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::ClusterTransport;
use crate::config::{CacheConfig, Properties};
use crate::entry::{Level, Region};
use crate::tier::{
    ExpirationListener, ExpiredKey, Level1Cache, Level1Provider, Level2Cache, Level2Provider,
    MemoryLevel2Provider, MokaProvider, NullProvider, ReadonlyLevel2Provider, RedisProvider,
};
use crate::CacheError;

/// Pending expirations buffered before the worker picks them up.
const EXPIRY_QUEUE: usize = 1024;

pub type Level1Factory = Arc<
    dyn Fn(Properties) -> BoxFuture<'static, Result<Arc<dyn Level1Provider>, CacheError>>
        + Send
        + Sync,
>;

pub type Level2Factory = Arc<
    dyn Fn(Properties) -> BoxFuture<'static, Result<Arc<dyn Level2Provider>, CacheError>>
        + Send
        + Sync,
>;

/// Name -> constructor maps for both levels.
///
/// A name registered at one level only is rejected at the other level with
/// [`CacheError::ProviderLevelMismatch`].
#[derive(Clone, Default)]
pub struct ProviderFactories {
    level1: HashMap<String, Level1Factory>,
    level2: HashMap<String, Level2Factory>,
}

impl ProviderFactories {
    /// No providers at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// `moka` and `none` for L1; `redis`, `readonly-redis`, `memory` and
    /// `none` for L2.
    pub fn with_builtins() -> Self {
        let mut factories = Self::empty();
        factories
            .register_level1("moka", |props| async move {
                Ok(Arc::new(MokaProvider::from_properties(&props)?) as Arc<dyn Level1Provider>)
            })
            .register_level1("none", |_| async {
                Ok(Arc::new(NullProvider) as Arc<dyn Level1Provider>)
            })
            .register_level2("redis", |props| async move {
                Ok(Arc::new(RedisProvider::connect(&props).await?) as Arc<dyn Level2Provider>)
            })
            .register_level2("readonly-redis", |props| async move {
                let inner = Arc::new(RedisProvider::connect(&props).await?);
                Ok(Arc::new(ReadonlyLevel2Provider::new(inner)) as Arc<dyn Level2Provider>)
            })
            .register_level2("memory", |props| async move {
                Ok(Arc::new(MemoryLevel2Provider::from_properties(&props)?)
                    as Arc<dyn Level2Provider>)
            })
            .register_level2("none", |_| async {
                Ok(Arc::new(NullProvider) as Arc<dyn Level2Provider>)
            });
        factories
    }

    pub fn register_level1<F, Fut>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(Properties) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Level1Provider>, CacheError>> + Send + 'static,
    {
        self.level1.insert(
            name.trim().to_ascii_lowercase(),
            Arc::new(move |props| factory(props).boxed()),
        );
        self
    }

    pub fn register_level2<F, Fut>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(Properties) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Level2Provider>, CacheError>> + Send + 'static,
    {
        self.level2.insert(
            name.trim().to_ascii_lowercase(),
            Arc::new(move |props| factory(props).boxed()),
        );
        self
    }

    async fn create_level1(
        &self,
        name: &str,
        props: Properties,
    ) -> Result<Arc<dyn Level1Provider>, CacheError> {
        let key = name.trim().to_ascii_lowercase();
        match self.level1.get(&key) {
            Some(factory) => factory(props).await,
            None if self.level2.contains_key(&key) => Err(CacheError::ProviderLevelMismatch {
                provider: name.to_owned(),
                level: Level::L1,
            }),
            None => Err(CacheError::UnknownProvider(name.to_owned())),
        }
    }

    async fn create_level2(
        &self,
        name: &str,
        props: Properties,
    ) -> Result<Arc<dyn Level2Provider>, CacheError> {
        let key = name.trim().to_ascii_lowercase();
        match self.level2.get(&key) {
            Some(factory) => factory(props).await,
            None if self.level1.contains_key(&key) => Err(CacheError::ProviderLevelMismatch {
                provider: name.to_owned(),
                level: Level::L2,
            }),
            None => Err(CacheError::UnknownProvider(name.to_owned())),
        }
    }
}

/// Holds both providers for the lifetime of the process.
pub struct ProviderRegistry {
    l1: Arc<dyn Level1Provider>,
    l2: Arc<dyn Level2Provider>,
    l2_caches: DashMap<String, Arc<OnceCell<Arc<dyn Level2Cache>>>>,
    listener: ExpirationListener,
    expired_rx: Mutex<Option<mpsc::Receiver<ExpiredKey>>>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ProviderRegistry {
    /// Build both providers from configuration.
    pub async fn init(
        config: &CacheConfig,
        factories: &ProviderFactories,
    ) -> Result<Arc<Self>, CacheError> {
        let l1 = factories
            .create_level1(&config.l1_provider, config.l1_properties.clone())
            .await?;
        info!("Using L1 cache provider: {}", l1.name());

        let l2 = match factories
            .create_level2(&config.l2_provider, config.l2_properties.clone())
            .await
        {
            Ok(l2) => l2,
            Err(e) => {
                l1.stop().await;
                return Err(e);
            }
        };
        info!("Using L2 cache provider: {}", l2.name());

        Ok(Self::from_providers(l1, l2))
    }

    /// Wrap already constructed providers.
    pub fn from_providers(l1: Arc<dyn Level1Provider>, l2: Arc<dyn Level2Provider>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(EXPIRY_QUEUE);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            l1,
            l2,
            l2_caches: DashMap::new(),
            listener: ExpirationListener::new(tx),
            expired_rx: Mutex::new(Some(rx)),
            shutdown_tx,
            worker: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn level1_provider(&self) -> &Arc<dyn Level1Provider> {
        &self.l1
    }

    pub fn level2_provider(&self) -> &Arc<dyn Level2Provider> {
        &self.l2
    }

    /// L1 handle for `region`, created on first use.
    pub async fn level1(&self, region: &str) -> Result<Arc<dyn Level1Cache>, CacheError> {
        self.l1
            .build_cache(region, None, self.listener.clone())
            .await
    }

    /// As [`level1`](Self::level1), with the TTL a new region should get.
    pub async fn level1_with_ttl(
        &self,
        region: &str,
        ttl_seconds: u64,
    ) -> Result<Arc<dyn Level1Cache>, CacheError> {
        self.l1
            .build_cache(region, Some(ttl_seconds), self.listener.clone())
            .await
    }

    /// L2 handle for `region`, constructed at most once.
    pub async fn level2(&self, region: &str) -> Result<Arc<dyn Level2Cache>, CacheError> {
        let cell = Arc::clone(
            self.l2_caches
                .entry(region.to_owned())
                .or_default()
                .value(),
        );
        cell.get_or_try_init(|| self.l2.build_cache(region))
            .await
            .cloned()
    }

    pub fn regions(&self) -> Vec<Region> {
        self.l1.regions()
    }

    pub fn remove_region(&self, region: &str) {
        self.l1.remove_cache(region);
    }

    /// Evict keys from the local L1 only. Used for received cluster commands.
    pub async fn evict_local(&self, region: &str, keys: &[String]) -> Result<(), CacheError> {
        self.level1(region).await?.evict(keys).await
    }

    /// Clear the local L1 region only.
    pub async fn clear_local(&self, region: &str) -> Result<(), CacheError> {
        self.level1(region).await?.clear().await
    }

    /// The sink handed to L1 stores.
    pub fn expiration_listener(&self) -> ExpirationListener {
        self.listener.clone()
    }

    /// Cleanup after L1 expired `(region, key)` on its own.
    ///
    /// Nothing happens when L1 holds a live value again: Moka reports an
    /// expired entry that is overwritten before cleanup as expired, and the
    /// new value must survive. Otherwise L2 is evicted first. When L2 has no
    /// TTL of its own, L1 is evicted again to drop anything a concurrent read
    /// copied back from the stale L2 value. Only then is the eviction
    /// broadcast.
    pub async fn handle_expired(
        &self,
        region: &str,
        key: &str,
        transport: &dyn ClusterTransport,
    ) -> Result<(), CacheError> {
        let level1 = self.level1(region).await?;
        if level1.get(key).await?.is_some() {
            debug!("Skipping expiry of rewritten key [{},{}]", region, key);
            return Ok(());
        }

        let keys = vec![key.to_owned()];
        let level2 = self.level2(region).await?;
        level2.evict(&keys).await?;
        if !level2.supports_ttl() {
            level1.evict(&keys).await?;
        }
        debug!(
            "Level 1 object expired, evicted level 2 object [{},{}]",
            region, key
        );
        transport.send_evict_cmd(region, keys).await
    }

    /// Start the background task that runs [`handle_expired`](Self::handle_expired)
    /// for every expiry L1 reports. Only the first call has an effect.
    pub fn start_expiration_worker(self: &Arc<Self>, transport: Arc<dyn ClusterTransport>) {
        let Some(mut rx) = self.expired_rx.lock().ok().and_then(|mut rx| rx.take()) else {
            warn!("Expiration worker already started");
            return;
        };
        let registry: Weak<Self> = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                let expired = tokio::select! {
                    _ = shutdown.changed() => break,
                    expired = rx.recv() => match expired {
                        Some(expired) => expired,
                        None => break,
                    },
                };
                let Some(live) = registry.upgrade() else {
                    break;
                };
                if let Err(e) = live
                    .handle_expired(&expired.region, &expired.key, transport.as_ref())
                    .await
                {
                    warn!(
                        "Expiry cascade failed for [{},{}]: {}",
                        expired.region, expired.key, e
                    );
                }
            }
            debug!("Expiration worker stopped");
        });

        if let Ok(mut worker) = self.worker.lock() {
            *worker = Some(handle);
        }
    }

    /// Stop the worker and both providers. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = worker {
            let _ = handle.await;
        }
        self.l1.stop().await;
        self.l2.stop().await;
        self.l2_caches.clear();
        info!("Cache providers shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::RecordingTransport;
    use crate::command::Operator;
    use crate::entry::CachedValue;
    use crate::tier::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn local_config() -> CacheConfig {
        CacheConfig {
            l1_provider: "moka".into(),
            l2_provider: "memory".into(),
            ..CacheConfig::default()
        }
    }

    async fn registry_with(store: MemoryStore, supports_ttl: bool) -> Arc<ProviderRegistry> {
        let l1 = MokaProvider::from_properties(&Properties::new()).unwrap();
        ProviderRegistry::from_providers(
            Arc::new(l1),
            Arc::new(MemoryLevel2Provider::new(store, supports_ttl)),
        )
    }

    async fn seed_level2(registry: &ProviderRegistry, region: &str, key: &str) {
        registry
            .level2(region)
            .await
            .unwrap()
            .set_bytes(key, b"1".to_vec(), 0)
            .await
            .unwrap();
    }

    async fn seed(registry: &ProviderRegistry, region: &str, key: &str) {
        seed_level2(registry, region, key).await;
        registry
            .level1(region)
            .await
            .unwrap()
            .put(key, CachedValue::present(json!(1)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_init_builtins() {
        let registry = ProviderRegistry::init(&local_config(), &ProviderFactories::with_builtins())
            .await
            .unwrap();
        assert_eq!(registry.level1_provider().name(), "moka");
        assert_eq!(registry.level2_provider().name(), "memory");
        registry.shutdown().await;
        registry.shutdown().await;
        assert!(registry.is_shutdown());
    }

    #[tokio::test]
    async fn test_level_mismatch() {
        let factories = ProviderFactories::with_builtins();

        let config = CacheConfig {
            l1_provider: "memory".into(),
            ..local_config()
        };
        let err = ProviderRegistry::init(&config, &factories).await.err().unwrap();
        assert!(matches!(
            err,
            CacheError::ProviderLevelMismatch { level: Level::L1, .. }
        ));

        let config = CacheConfig {
            l2_provider: "moka".into(),
            ..local_config()
        };
        let err = ProviderRegistry::init(&config, &factories).await.err().unwrap();
        assert!(matches!(
            err,
            CacheError::ProviderLevelMismatch { level: Level::L2, .. }
        ));

        let config = CacheConfig {
            l2_provider: "ehcache".into(),
            ..local_config()
        };
        let err = ProviderRegistry::init(&config, &factories).await.err().unwrap();
        assert!(matches!(err, CacheError::UnknownProvider(_)));
    }

    #[tokio::test]
    async fn test_custom_provider_registration() {
        let store = MemoryStore::new();
        let mut factories = ProviderFactories::with_builtins();
        factories.register_level2("Shared", {
            let store = store.clone();
            move |_| {
                let store = store.clone();
                async move {
                    Ok(Arc::new(MemoryLevel2Provider::new(store, false)) as Arc<dyn Level2Provider>)
                }
            }
        });
        let config = CacheConfig {
            l2_provider: "shared".into(),
            ..local_config()
        };
        let registry = ProviderRegistry::init(&config, &factories).await.unwrap();
        registry
            .level2("r")
            .await
            .unwrap()
            .set_bytes("k", b"v".to_vec(), 0)
            .await
            .unwrap();

        let direct = MemoryLevel2Provider::new(store, false);
        let cache = direct.build_cache("r").await.unwrap();
        assert_eq!(cache.get_bytes("k").await.unwrap(), Some(b"v".to_vec()));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_level2_handle_is_shared() {
        let registry = registry_with(MemoryStore::new(), true).await;
        let a = registry.level2("r").await.unwrap();
        let b = registry.level2("r").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_cascade_without_l2_ttl() {
        let registry = registry_with(MemoryStore::new(), false).await;
        let transport = RecordingTransport::default();
        seed_level2(&registry, "users", "42").await;

        registry
            .handle_expired("users", "42", &transport)
            .await
            .unwrap();

        let l2 = registry.level2("users").await.unwrap();
        assert_eq!(l2.get_bytes("42").await.unwrap(), None);
        let l1 = registry.level1("users").await.unwrap();
        assert_eq!(l1.get("42").await.unwrap(), None);

        let sent = transport.published();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].operator, Operator::EvictKey);
        assert_eq!(sent[0].region, "users");
        assert_eq!(sent[0].keys, vec!["42".to_owned()]);
    }

    #[tokio::test]
    async fn test_cascade_with_l2_ttl() {
        let registry = registry_with(MemoryStore::new(), true).await;
        let transport = RecordingTransport::default();
        seed_level2(&registry, "users", "42").await;

        registry
            .handle_expired("users", "42", &transport)
            .await
            .unwrap();

        let l2 = registry.level2("users").await.unwrap();
        assert_eq!(l2.get_bytes("42").await.unwrap(), None);
        assert_eq!(transport.published().len(), 1);
    }

    #[tokio::test]
    async fn test_cascade_skips_rewritten_key() {
        let registry = registry_with(MemoryStore::new(), false).await;
        let transport = RecordingTransport::default();
        seed(&registry, "users", "42").await;

        registry
            .handle_expired("users", "42", &transport)
            .await
            .unwrap();

        let l2 = registry.level2("users").await.unwrap();
        assert_eq!(l2.get_bytes("42").await.unwrap(), Some(b"1".to_vec()));
        let l1 = registry.level1("users").await.unwrap();
        assert!(l1.get("42").await.unwrap().is_some());
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_rewrite_after_ttl_survives_cleanup() {
        let props = Properties::new()
            .with("region.short", "10, 1s")
            .with("housekeeping_ms", "60000");
        let l1 = Arc::new(MokaProvider::from_properties(&props).unwrap());
        let registry = ProviderRegistry::from_providers(
            l1.clone(),
            Arc::new(MemoryLevel2Provider::new(MemoryStore::new(), false)),
        );
        let transport = Arc::new(RecordingTransport::default());
        registry.start_expiration_worker(transport.clone());

        let level1 = registry.level1("short").await.unwrap();
        let level2 = registry.level2("short").await.unwrap();
        level2.set_bytes("k", b"\"v1\"".to_vec(), 0).await.unwrap();
        level1.put("k", CachedValue::present(json!("v1"))).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1300)).await;
        level2.set_bytes("k", b"\"v2\"".to_vec(), 0).await.unwrap();
        level1.put("k", CachedValue::present(json!("v2"))).await.unwrap();
        // flushes the expiry moka recorded for the overwritten v1
        l1.region("short").unwrap().run_pending_tasks().await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(
            level1.get("k").await.unwrap(),
            Some(CachedValue::present(json!("v2")))
        );
        assert_eq!(level2.get_bytes("k").await.unwrap(), Some(b"\"v2\"".to_vec()));
        assert!(transport.published().is_empty());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_runs_cascade() {
        let registry = registry_with(MemoryStore::new(), false).await;
        let transport = Arc::new(RecordingTransport::default());
        seed_level2(&registry, "r", "k").await;

        registry.start_expiration_worker(transport.clone());
        registry.expiration_listener().notify_expired("r", "k");

        let l2 = registry.level2("r").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while transport.published().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(l2.get_bytes("k").await.unwrap(), None);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_local_evict_and_clear_touch_l1_only() {
        let registry = registry_with(MemoryStore::new(), true).await;
        seed(&registry, "r", "a").await;
        seed(&registry, "r", "b").await;

        registry.evict_local("r", &["a".to_owned()]).await.unwrap();
        let l1 = registry.level1("r").await.unwrap();
        assert!(l1.get("a").await.unwrap().is_none());
        assert!(l1.get("b").await.unwrap().is_some());

        registry.clear_local("r").await.unwrap();
        assert!(l1.get("b").await.unwrap().is_none());

        let l2 = registry.level2("r").await.unwrap();
        assert!(l2.get_bytes("a").await.unwrap().is_some());
    }
}
