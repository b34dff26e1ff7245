//! Tiered cache facade
//!
//! Reads go L1 -> L2 and copy L2 hits back into L1. Writes go L2 -> L1 and
//! then broadcast an eviction so other nodes drop their L1 copy and re-read
//! L2 on their next access.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterTransport, TransportFactories, TransportState};
use crate::command::SourceId;
use crate::config::{CacheConfig, Properties};
use crate::context::NodeContext;
use crate::entry::{CacheEntry, CachedValue, Level, Region};
use crate::registry::{ProviderFactories, ProviderRegistry};
use crate::serializer::{Serializer, serializer_for};
use crate::tier::{Level1Cache, Level1Provider, Level2Provider};
use crate::CacheError;

/// Source of values the cache does not hold, e.g. a database.
#[async_trait]
pub trait DataLoader: Send + Sync {
    /// `Ok(None)` means the key has no value.
    async fn load(
        &self,
        region: &str,
        key: &str,
    ) -> Result<Option<Value>, Box<dyn std::error::Error + Send + Sync>>;
}

/// Per-write options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// 0 keeps the region's TTL.
    pub ttl_seconds: u64,
    /// Ask other nodes to drop their L1 copy. Ignored when the configuration
    /// broadcasts every write anyway.
    pub broadcast: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            ttl_seconds: 0,
            broadcast: true,
        }
    }
}

impl WriteOptions {
    pub fn ttl(seconds: u64) -> Self {
        Self {
            ttl_seconds: seconds,
            ..Self::default()
        }
    }

    pub fn without_broadcast(mut self) -> Self {
        self.broadcast = false;
        self
    }
}

type LoadResult = Result<Option<CachedValue>, String>;
type InFlightLoad = watch::Receiver<Option<LoadResult>>;
type InFlightMap = Arc<Mutex<HashMap<(String, String), InFlightLoad>>>;

/// Owns one in-flight load. Waiters are released with an error if the guard
/// is dropped before [`complete`](Self::complete).
struct InFlightGuard {
    id: (String, String),
    in_flight: InFlightMap,
    tx: Option<watch::Sender<Option<LoadResult>>>,
}

impl InFlightGuard {
    fn complete(mut self, result: LoadResult) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(result));
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(Err("load was cancelled".to_owned())));
        }
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

enum LoadSlot {
    Lead(InFlightGuard),
    Wait(InFlightLoad),
}

struct Inner {
    config: CacheConfig,
    context: NodeContext,
    registry: Arc<ProviderRegistry>,
    transport: Arc<dyn ClusterTransport>,
    in_flight: InFlightMap,
    closed: AtomicBool,
}

/// Entry point for application code. Cheap to clone.
#[derive(Clone)]
pub struct TieredCache {
    inner: Arc<Inner>,
}

impl TieredCache {
    /// Build with the built-in providers and transports.
    pub async fn new(config: CacheConfig) -> Result<Self, CacheError> {
        Self::builder(config).build().await
    }

    pub fn builder(config: CacheConfig) -> TieredCacheBuilder {
        TieredCacheBuilder::new(config)
    }

    pub fn source(&self) -> SourceId {
        self.inner.context.source()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn context(&self) -> &NodeContext {
        &self.inner.context
    }

    pub fn transport_state(&self) -> TransportState {
        self.inner.transport.state()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.is_closed() {
            return Err(CacheError::ChannelClosed);
        }
        Ok(())
    }

    /// Read one key. A miss on both levels is not an error; only both levels
    /// failing is.
    pub async fn get(&self, region: &str, key: &str) -> Result<CacheEntry, CacheError> {
        self.ensure_open()?;

        let level1 = match self.inner.registry.level1(region).await {
            Ok(l1) => match l1.get(key).await {
                Ok(Some(value)) => {
                    debug!("L1 hit [{},{}]", region, key);
                    return Ok(CacheEntry::new(region, key, Level::L1, Some(value)));
                }
                Ok(None) => Some(l1),
                Err(e) => {
                    warn!("L1 read failed for [{},{}]: {}", region, key, e);
                    None
                }
            },
            Err(e) => {
                warn!("L1 region [{}] unavailable: {}", region, e);
                None
            }
        };

        let value = match self.read_level2(region, key).await {
            Ok(value) => value,
            Err(e) if level1.is_none() => return Err(e),
            Err(e) => {
                warn!(
                    "L2 read failed for [{},{}], treating as a miss: {}",
                    region, key, e
                );
                return Ok(CacheEntry::new(region, key, Level::L2, None));
            }
        };

        let value = value.map(CachedValue::present);
        if let Some(l1) = level1 {
            let backfill = match &value {
                Some(found) => Some(found.clone()),
                None if self.inner.config.cache_absence => Some(CachedValue::Absent),
                None => None,
            };
            if let Some(backfill) = backfill
                && let Err(e) = l1.put(key, backfill).await
            {
                warn!("Failed to populate L1 for [{},{}]: {}", region, key, e);
            }
        }
        if value.is_some() {
            debug!("L2 hit [{},{}]", region, key);
        } else {
            debug!("Cache miss [{},{}]", region, key);
        }
        Ok(CacheEntry::new(region, key, Level::L2, value))
    }

    /// Batch read. Keys neither level holds are left out, or carry the
    /// absence sentinel when absence caching is on.
    pub async fn get_many<I, K>(
        &self,
        region: &str,
        keys: I,
    ) -> Result<HashMap<String, CacheEntry>, CacheError>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.ensure_open()?;
        let mut seen = HashSet::new();
        let wanted: Vec<String> = keys
            .into_iter()
            .map(Into::into)
            .filter(|k| seen.insert(k.clone()))
            .collect();
        let mut found = HashMap::with_capacity(wanted.len());
        if wanted.is_empty() {
            return Ok(found);
        }

        let level1 = match self.inner.registry.level1(region).await {
            Ok(l1) => match l1.get_many(&wanted).await {
                Ok(hits) => {
                    for (key, value) in hits {
                        let entry = CacheEntry::new(region, key.clone(), Level::L1, Some(value));
                        found.insert(key, entry);
                    }
                    Some(l1)
                }
                Err(e) => {
                    warn!("L1 batch read failed for [{}]: {}", region, e);
                    None
                }
            },
            Err(e) => {
                warn!("L1 region [{}] unavailable: {}", region, e);
                None
            }
        };

        let missing: Vec<String> = wanted
            .into_iter()
            .filter(|k| !found.contains_key(k))
            .collect();
        if missing.is_empty() {
            return Ok(found);
        }

        let values = match self.read_many_level2(region, &missing).await {
            Ok(values) => values,
            Err(e) if level1.is_none() => return Err(e),
            Err(e) => {
                warn!("L2 batch read failed for [{}], treating as misses: {}", region, e);
                return Ok(found);
            }
        };

        let mut backfill = HashMap::new();
        for (key, value) in missing.into_iter().zip(values) {
            let cached = match value {
                Some(value) => CachedValue::present(value),
                None if self.inner.config.cache_absence => CachedValue::Absent,
                None => continue,
            };
            backfill.insert(key.clone(), cached.clone());
            found.insert(key.clone(), CacheEntry::new(region, key, Level::L2, Some(cached)));
        }
        if let Some(l1) = &level1
            && !backfill.is_empty()
            && let Err(e) = l1.put_many(backfill).await
        {
            warn!("Failed to populate L1 region [{}]: {}", region, e);
        }
        Ok(found)
    }

    /// True when either level holds a value for `key`.
    pub async fn exists(&self, region: &str, key: &str) -> Result<bool, CacheError> {
        self.ensure_open()?;
        if let Ok(l1) = self.inner.registry.level1(region).await
            && let Ok(Some(cached)) = l1.get(key).await
        {
            return Ok(!cached.is_absent());
        }
        self.inner.registry.level2(region).await?.exists(key).await
    }

    pub async fn set<V>(&self, region: &str, key: &str, value: &V) -> Result<(), CacheError>
    where
        V: Serialize + Sync + ?Sized,
    {
        self.set_with(region, key, value, WriteOptions::default())
            .await
    }

    /// Write L2, then L1, then broadcast an eviction of `key`.
    pub async fn set_with<V>(
        &self,
        region: &str,
        key: &str,
        value: &V,
        options: WriteOptions,
    ) -> Result<(), CacheError>
    where
        V: Serialize + Sync + ?Sized,
    {
        self.ensure_open()?;
        let value = serde_json::to_value(value)?;
        let bytes = self.inner.context.serializer().serialize(&value)?;

        let l1 = self.level1_for_write(region, options.ttl_seconds).await?;
        let l2 = self.inner.registry.level2(region).await?;
        l2.set_bytes(key, bytes, self.level2_ttl(l1.as_ref(), options.ttl_seconds))
            .await?;
        l1.put(key, CachedValue::present(value)).await?;

        if self.broadcasts(options) {
            self.bounded(self.inner.transport.send_evict_cmd(region, vec![key.to_owned()]))
                .await?;
        }
        Ok(())
    }

    pub async fn set_many<V>(
        &self,
        region: &str,
        values: &HashMap<String, V>,
    ) -> Result<(), CacheError>
    where
        V: Serialize + Sync,
    {
        self.set_many_with(region, values, WriteOptions::default())
            .await
    }

    /// Batch write with one broadcast carrying every key.
    pub async fn set_many_with<V>(
        &self,
        region: &str,
        values: &HashMap<String, V>,
        options: WriteOptions,
    ) -> Result<(), CacheError>
    where
        V: Serialize + Sync,
    {
        self.ensure_open()?;
        if values.is_empty() {
            return Ok(());
        }
        let serializer = self.inner.context.serializer();
        let mut encoded = HashMap::with_capacity(values.len());
        let mut local = HashMap::with_capacity(values.len());
        for (key, value) in values {
            let value = serde_json::to_value(value)?;
            encoded.insert(key.clone(), serializer.serialize(&value)?);
            local.insert(key.clone(), CachedValue::present(value));
        }
        let keys: Vec<String> = values.keys().cloned().collect();

        let l1 = self.level1_for_write(region, options.ttl_seconds).await?;
        let l2 = self.inner.registry.level2(region).await?;
        l2.set_many_bytes(encoded, self.level2_ttl(l1.as_ref(), options.ttl_seconds))
            .await?;
        l1.put_many(local).await?;

        if self.broadcasts(options) {
            self.bounded(self.inner.transport.send_evict_cmd(region, keys)).await?;
        }
        Ok(())
    }

    /// Remove keys from both levels, then broadcast.
    pub async fn evict<I, K>(&self, region: &str, keys: I) -> Result<(), CacheError>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.ensure_open()?;
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        if keys.is_empty() {
            return Ok(());
        }
        self.inner.registry.level2(region).await?.evict(&keys).await?;
        self.inner.registry.level1(region).await?.evict(&keys).await?;
        self.bounded(self.inner.transport.send_evict_cmd(region, keys)).await
    }

    /// Empty the region on both levels, then broadcast.
    pub async fn clear(&self, region: &str) -> Result<(), CacheError> {
        self.ensure_open()?;
        self.inner.registry.level2(region).await?.clear().await?;
        self.inner.registry.level1(region).await?.clear().await?;
        self.bounded(self.inner.transport.send_clear_cmd(region)).await
    }

    /// L1 keys of the region.
    pub async fn keys(&self, region: &str) -> Result<HashSet<String>, CacheError> {
        self.ensure_open()?;
        self.inner.registry.level1(region).await?.keys().await
    }

    pub fn regions(&self) -> Result<Vec<Region>, CacheError> {
        self.ensure_open()?;
        Ok(self.inner.registry.regions())
    }

    /// Drop the local L1 region. Other nodes and L2 are untouched.
    pub fn remove_region(&self, region: &str) -> Result<(), CacheError> {
        self.ensure_open()?;
        self.inner.registry.remove_region(region);
        Ok(())
    }

    /// [`get`](Self::get), falling back to `loader` on a miss. The loaded
    /// value is written through both levels. Concurrent callers for the same
    /// key share one loader call.
    pub async fn get_or_load(
        &self,
        region: &str,
        key: &str,
        loader: &dyn DataLoader,
    ) -> Result<CacheEntry, CacheError> {
        let cached = self.get(region, key).await?;
        if !cached.is_miss() {
            return Ok(cached);
        }

        let id = (region.to_owned(), key.to_owned());
        let slot = {
            let mut in_flight = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(&id) {
                Some(rx) => LoadSlot::Wait(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(id.clone(), rx);
                    LoadSlot::Lead(InFlightGuard {
                        id,
                        in_flight: Arc::clone(&self.inner.in_flight),
                        tx: Some(tx),
                    })
                }
            }
        };

        let guard = match slot {
            LoadSlot::Wait(rx) => {
                debug!("Waiting for in-flight load of [{},{}]", region, key);
                return await_load(region, key, rx).await;
            }
            LoadSlot::Lead(guard) => guard,
        };

        let loaded = self.load_through(region, key, loader).await;
        guard.complete(match &loaded {
            Ok(value) => Ok(value.clone()),
            Err(e) => Err(e.to_string()),
        });
        loaded.map(|value| CacheEntry::new(region, key, Level::Outer, value))
    }

    async fn load_through(
        &self,
        region: &str,
        key: &str,
        loader: &dyn DataLoader,
    ) -> Result<Option<CachedValue>, CacheError> {
        match loader.load(region, key).await {
            Ok(Some(value)) => {
                self.set(region, key, &value).await?;
                Ok(Some(CachedValue::present(value)))
            }
            Ok(None) if self.inner.config.cache_absence => {
                self.inner
                    .registry
                    .level1(region)
                    .await?
                    .put(key, CachedValue::Absent)
                    .await?;
                Ok(Some(CachedValue::Absent))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                error!("Loader failed for [{},{}]: {}", region, key, e);
                Err(CacheError::Loader(e))
            }
        }
    }

    /// Disconnect from the cluster and stop both providers. Every later
    /// operation fails with [`CacheError::ChannelClosed`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.transport.disconnect().await;
        self.inner.registry.shutdown().await;
        info!("Tiered cache closed");
    }

    async fn read_level2(&self, region: &str, key: &str) -> Result<Option<Value>, CacheError> {
        let l2 = self.inner.registry.level2(region).await?;
        let Some(bytes) = l2.get_bytes(key).await? else {
            return Ok(None);
        };
        match self.inner.context.serializer().deserialize(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(CacheError::Deserialize(reason)) => {
                warn!(
                    "Corrupt L2 entry [{},{}] ({}), deleting",
                    region, key, reason
                );
                if let Err(e) = l2.evict(&[key.to_owned()]).await {
                    warn!("Failed to delete corrupt L2 entry [{},{}]: {}", region, key, e);
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn read_many_level2(
        &self,
        region: &str,
        keys: &[String],
    ) -> Result<Vec<Option<Value>>, CacheError> {
        let l2 = self.inner.registry.level2(region).await?;
        let slots = l2.get_many_bytes(keys).await?;
        let serializer = self.inner.context.serializer();

        let mut corrupt = Vec::new();
        let mut values = Vec::with_capacity(slots.len());
        for (key, slot) in keys.iter().zip(slots) {
            let value = match slot {
                Some(bytes) => match serializer.deserialize(&bytes) {
                    Ok(value) => Some(value),
                    Err(CacheError::Deserialize(reason)) => {
                        warn!("Corrupt L2 entry [{},{}] ({}), deleting", region, key, reason);
                        corrupt.push(key.clone());
                        None
                    }
                    Err(e) => return Err(e),
                },
                None => None,
            };
            values.push(value);
        }
        if !corrupt.is_empty()
            && let Err(e) = l2.evict(&corrupt).await
        {
            warn!("Failed to delete corrupt L2 entries in [{}]: {}", region, e);
        }
        Ok(values)
    }

    async fn level1_for_write(
        &self,
        region: &str,
        ttl_seconds: u64,
    ) -> Result<Arc<dyn Level1Cache>, CacheError> {
        if ttl_seconds > 0 {
            self.inner
                .registry
                .level1_with_ttl(region, ttl_seconds)
                .await
        } else {
            self.inner.registry.level1(region).await
        }
    }

    /// L2 TTL for a write: the requested one, else the L1 region's.
    fn level2_ttl(&self, l1: &dyn Level1Cache, requested: u64) -> u64 {
        if !self.inner.config.sync_ttl_to_l2 {
            return 0;
        }
        if requested > 0 {
            requested
        } else {
            l1.ttl_seconds()
        }
    }

    fn broadcasts(&self, options: WriteOptions) -> bool {
        options.broadcast || self.inner.config.broadcast_on_set
    }

    /// Run a broadcast under the transport timeout.
    async fn bounded(
        &self,
        broadcast: impl Future<Output = Result<(), CacheError>>,
    ) -> Result<(), CacheError> {
        tokio::time::timeout(self.inner.config.transport_timeout, broadcast).await?
    }
}

async fn await_load(
    region: &str,
    key: &str,
    mut rx: InFlightLoad,
) -> Result<CacheEntry, CacheError> {
    loop {
        let current = rx.borrow().clone();
        if let Some(result) = current {
            return result
                .map(|value| CacheEntry::new(region, key, Level::Outer, value))
                .map_err(|reason| CacheError::Loader(reason.into()));
        }
        if rx.changed().await.is_err() {
            return Err(CacheError::Loader("in-flight load abandoned".into()));
        }
    }
}

/// Assembles a [`TieredCache`]: providers, transport, serializer.
pub struct TieredCacheBuilder {
    config: CacheConfig,
    providers: ProviderFactories,
    transports: TransportFactories,
    serializer: Option<Arc<dyn Serializer>>,
    source: Option<SourceId>,
}

impl TieredCacheBuilder {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            providers: ProviderFactories::with_builtins(),
            transports: TransportFactories::with_builtins(),
            serializer: None,
            source: None,
        }
    }

    /// Register an L1 provider under `name`.
    pub fn level1_provider<F, Fut>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(Properties) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Level1Provider>, CacheError>> + Send + 'static,
    {
        self.providers.register_level1(name, factory);
        self
    }

    /// Register an L2 provider under `name`.
    pub fn level2_provider<F, Fut>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(Properties) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Level2Provider>, CacheError>> + Send + 'static,
    {
        self.providers.register_level2(name, factory);
        self
    }

    /// Register a cluster transport under `name`.
    pub fn transport<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(&CacheConfig, &NodeContext) -> Result<Arc<dyn ClusterTransport>, CacheError>
            + Send
            + Sync
            + 'static,
    {
        self.transports.register(name, factory);
        self
    }

    /// Replace the serializer named in the configuration.
    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Fix the node id instead of generating one.
    pub fn source(mut self, source: SourceId) -> Self {
        self.source = Some(source);
        self
    }

    pub async fn build(self) -> Result<TieredCache, CacheError> {
        let serializer = match self.serializer {
            Some(serializer) => serializer,
            None => serializer_for(&self.config.serialization)?,
        };
        let context = NodeContext::new(self.source.unwrap_or_else(SourceId::generate), serializer);

        let registry = ProviderRegistry::init(&self.config, &self.providers).await?;
        let transport = match self
            .transports
            .create(&self.config.broadcast, &self.config, &context)
        {
            Ok(transport) => transport,
            Err(e) => {
                registry.shutdown().await;
                return Err(e);
            }
        };

        let connected = match tokio::time::timeout(
            self.config.transport_timeout,
            transport.connect(Arc::clone(&registry)),
        )
        .await
        {
            Ok(result) => result,
            Err(elapsed) => Err(elapsed.into()),
        };
        if let Err(e) = connected {
            error!("Failed to connect cluster transport {}: {}", transport.name(), e);
            transport.disconnect().await;
            registry.shutdown().await;
            return Err(e);
        }
        info!(
            "Using cluster transport: {} (node {})",
            transport.name(),
            context.source()
        );

        registry.start_expiration_worker(Arc::clone(&transport));
        Ok(TieredCache {
            inner: Arc::new(Inner {
                config: self.config,
                context,
                registry,
                transport,
                in_flight: Arc::new(Mutex::new(HashMap::new())),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::RecordingTransport;
    use crate::cluster::{BroadcastBus, BusTransport};
    use crate::command::Operator;
    use crate::tier::testing::{Behaviour, ScriptedProvider};
    use crate::tier::{MemoryLevel2Provider, MemoryStore};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn shared_config() -> CacheConfig {
        CacheConfig {
            l2_provider: "shared".into(),
            broadcast: "bus".into(),
            ..CacheConfig::default()
        }
    }

    async fn node(
        store: &MemoryStore,
        bus: &BroadcastBus,
        config: CacheConfig,
        l2_ttl: bool,
    ) -> (TieredCache, Arc<BusTransport>) {
        let source = SourceId::generate();
        let transport = Arc::new(bus.transport(source));
        let store = store.clone();
        let for_factory = Arc::clone(&transport);
        let cache = TieredCache::builder(config)
            .source(source)
            .level2_provider("shared", move |_| {
                let store = store.clone();
                async move {
                    Ok(Arc::new(MemoryLevel2Provider::new(store, l2_ttl)) as Arc<dyn Level2Provider>)
                }
            })
            .transport("bus", move |_, _| {
                Ok(Arc::clone(&for_factory) as Arc<dyn ClusterTransport>)
            })
            .build()
            .await
            .unwrap();
        (cache, transport)
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn wait_handled(transport: &Arc<BusTransport>, n: u64) {
        let transport = Arc::clone(transport);
        eventually(move || {
            let transport = Arc::clone(&transport);
            async move { transport.handled_count() >= n }
        })
        .await;
    }

    async fn evicted(cache: &TieredCache, region: &str, key: &str) -> bool {
        !cache.keys(region).await.unwrap().contains(key)
    }

    async fn recording_node(config: CacheConfig) -> (TieredCache, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let for_factory = Arc::clone(&transport);
        let cache = TieredCache::builder(CacheConfig {
            broadcast: "recording".into(),
            ..config
        })
        .transport("recording", move |_, _| {
            Ok(Arc::clone(&for_factory) as Arc<dyn ClusterTransport>)
        })
        .build()
        .await
        .unwrap();
        (cache, transport)
    }

    struct CountingLoader {
        calls: AtomicUsize,
        value: Option<Value>,
    }

    #[async_trait]
    impl DataLoader for CountingLoader {
        async fn load(
            &self,
            _region: &str,
            _key: &str,
        ) -> Result<Option<Value>, Box<dyn std::error::Error + Send + Sync>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(self.value.clone())
        }
    }

    #[tokio::test]
    async fn test_write_then_local_read() {
        let cache = TieredCache::new(CacheConfig::local()).await.unwrap();
        let value = json!({"name": "a"});

        cache
            .set_with("users", "42", &value, WriteOptions::ttl(60))
            .await
            .unwrap();
        let entry = cache.get("users", "42").await.unwrap();
        assert_eq!(entry.level(), Level::L1);
        assert_eq!(entry.value(), Some(&value));

        let regions = cache.regions().unwrap();
        let users = regions.iter().find(|r| r.name == "users").unwrap();
        assert_eq!(users.ttl_seconds, 60);
        assert!(cache.exists("users", "42").await.unwrap());
        assert!(!cache.exists("users", "43").await.unwrap());
        cache.close().await;
    }

    #[tokio::test]
    async fn test_typed_values() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct User {
            name: String,
            age: u32,
        }

        let cache = TieredCache::new(CacheConfig::local()).await.unwrap();
        let user = User {
            name: "bo".into(),
            age: 7,
        };
        cache.set("users", "7", &user).await.unwrap();
        let entry = cache.get("users", "7").await.unwrap();
        assert_eq!(entry.value_as::<User>().unwrap(), Some(user));
        cache.close().await;
    }

    #[tokio::test]
    async fn test_l2_hit_is_copied_to_l1() {
        let store = MemoryStore::new();
        let bus = BroadcastBus::default();
        let (a, _) = node(&store, &bus, shared_config(), true).await;
        let (b, b_bus) = node(&store, &bus, shared_config(), true).await;

        a.set("users", "42", &json!("v1")).await.unwrap();
        // b: own join, then a's eviction
        wait_handled(&b_bus, 2).await;
        let first = b.get("users", "42").await.unwrap();
        assert_eq!(first.level(), Level::L2);
        assert_eq!(first.value(), Some(&json!("v1")));

        let second = b.get("users", "42").await.unwrap();
        assert_eq!(second.level(), Level::L1);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_cross_node_invalidation() {
        let store = MemoryStore::new();
        let bus = BroadcastBus::default();
        let (a, _) = node(&store, &bus, shared_config(), true).await;
        let (b, _) = node(&store, &bus, shared_config(), true).await;

        b.set("users", "42", &json!("v1")).await.unwrap();
        assert_eq!(b.get("users", "42").await.unwrap().level(), Level::L1);

        a.set("users", "42", &json!("v2")).await.unwrap();
        let b_ref = &b;
        eventually(move || evicted(b_ref, "users", "42")).await;

        let entry = b.get("users", "42").await.unwrap();
        assert_eq!(entry.value(), Some(&json!("v2")));
        assert_eq!(entry.level(), Level::L2);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_remote_evict_reaches_other_node() {
        let store = MemoryStore::new();
        let bus = BroadcastBus::default();
        let (a, _) = node(&store, &bus, shared_config(), true).await;
        let (b, _) = node(&store, &bus, shared_config(), true).await;

        b.set("users", "42", &json!({"name": "a"})).await.unwrap();
        a.evict("users", ["42"]).await.unwrap();
        let b_ref = &b;
        eventually(move || evicted(b_ref, "users", "42")).await;
        assert!(b.get("users", "42").await.unwrap().is_miss());

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_own_broadcast_does_not_evict_local_copy() {
        let store = MemoryStore::new();
        let bus = BroadcastBus::default();
        let (a, transport) = node(&store, &bus, shared_config(), true).await;

        a.set("users", "42", &json!("mine")).await.unwrap();
        // own join, then own evict
        wait_handled(&transport, 2).await;

        assert!(a.keys("users").await.unwrap().contains("42"));
        assert_eq!(a.get("users", "42").await.unwrap().level(), Level::L1);
        a.close().await;
    }

    #[tokio::test]
    async fn test_expiry_cascade_clears_l2() {
        let store = MemoryStore::new();
        let bus = BroadcastBus::default();
        let config = CacheConfig {
            l1_properties: Properties::new()
                .with("region.short", "10, 1s")
                .with("housekeeping_ms", "100"),
            ..shared_config()
        };
        let (a, _) = node(&store, &bus, config, false).await;
        a.set("short", "k", &json!(1)).await.unwrap();

        let l2 = MemoryLevel2Provider::new(store.clone(), false)
            .build_cache("short")
            .await
            .unwrap();
        assert!(l2.get_bytes("k").await.unwrap().is_some());

        eventually(|| {
            let l2 = Arc::clone(&l2);
            async move { l2.get_bytes("k").await.unwrap().is_none() }
        })
        .await;
        assert!(a.get("short", "k").await.unwrap().is_miss());
        a.close().await;
    }

    #[tokio::test]
    async fn test_absence_caching() {
        let store = MemoryStore::new();
        let bus = BroadcastBus::default();
        let config = CacheConfig {
            cache_absence: true,
            ..shared_config()
        };
        let (a, _) = node(&store, &bus, config, true).await;

        let first = a.get("users", "nobody").await.unwrap();
        assert!(first.is_miss());
        let second = a.get("users", "nobody").await.unwrap();
        assert!(second.is_absent());
        assert_eq!(second.level(), Level::L1);
        assert_eq!(store.read_count(), 1);
        assert!(!a.exists("users", "nobody").await.unwrap());

        a.set("users", "nobody", &json!("now")).await.unwrap();
        let third = a.get("users", "nobody").await.unwrap();
        assert_eq!(third.value(), Some(&json!("now")));
        a.close().await;
    }

    #[tokio::test]
    async fn test_remote_write_replaces_absence_marker() {
        let store = MemoryStore::new();
        let bus = BroadcastBus::default();
        let config = CacheConfig {
            cache_absence: true,
            ..shared_config()
        };
        let (a, _) = node(&store, &bus, config.clone(), true).await;
        let (b, _) = node(&store, &bus, config, true).await;

        assert!(b.get("users", "7").await.unwrap().is_miss());
        assert!(b.get("users", "7").await.unwrap().is_absent());

        a.set("users", "7", &json!("arrived")).await.unwrap();
        let b_ref = &b;
        eventually(move || evicted(b_ref, "users", "7")).await;

        let entry = b.get("users", "7").await.unwrap();
        assert_eq!(entry.value(), Some(&json!("arrived")));
        assert_eq!(entry.level(), Level::L2);
        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_rewrite_after_l1_expiry_is_kept() {
        let store = MemoryStore::new();
        let bus = BroadcastBus::default();
        let config = CacheConfig {
            l1_properties: Properties::new()
                .with("region.short", "10, 1s")
                .with("housekeeping_ms", "60000"),
            ..shared_config()
        };
        let (a, _) = node(&store, &bus, config, false).await;

        a.set("short", "k", &json!("v1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1300)).await;
        a.set("short", "k", &json!("v2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let entry = a.get("short", "k").await.unwrap();
        assert_eq!(entry.value(), Some(&json!("v2")));
        a.close().await;
    }

    #[tokio::test]
    async fn test_both_levels_down() {
        let store = MemoryStore::new();
        let raw = MemoryLevel2Provider::new(store.clone(), true)
            .build_cache("r")
            .await
            .unwrap();
        raw.set_bytes("k", b"\"from l2\"".to_vec(), 0).await.unwrap();

        let for_factory = store.clone();
        let cache = TieredCache::builder(CacheConfig {
            l1_provider: "down".into(),
            l2_provider: "shared".into(),
            broadcast: "none".into(),
            ..CacheConfig::default()
        })
        .level1_provider("down", |_| async {
            Ok(Arc::new(ScriptedProvider::new(Behaviour::Down)) as Arc<dyn Level1Provider>)
        })
        .level2_provider("shared", move |_| {
            let store = for_factory.clone();
            async move {
                Ok(Arc::new(MemoryLevel2Provider::new(store, true)) as Arc<dyn Level2Provider>)
            }
        })
        .build()
        .await
        .unwrap();

        // L1 failing, L2 healthy: served from L2
        let entry = cache.get("r", "k").await.unwrap();
        assert_eq!(entry.value(), Some(&json!("from l2")));
        assert_eq!(entry.level(), Level::L2);
        let found = cache.get_many("r", ["k", "missing"]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["k"].value(), Some(&json!("from l2")));

        store.set_available(false);
        assert!(cache.get("r", "k").await.unwrap_err().is_unavailable());
        assert!(cache
            .get_many("r", ["k", "missing"])
            .await
            .unwrap_err()
            .is_unavailable());

        store.set_available(true);
        cache.close().await;
    }

    #[tokio::test]
    async fn test_batch_read_and_write() {
        let store = MemoryStore::new();
        let bus = BroadcastBus::default();
        let (a, _) = node(&store, &bus, shared_config(), true).await;
        let (b, b_bus) = node(&store, &bus, shared_config(), true).await;

        let mut values = HashMap::new();
        values.insert("a".to_owned(), json!(1));
        values.insert("b".to_owned(), json!(2));
        a.set_many("nums", &values).await.unwrap();
        wait_handled(&b_bus, 2).await;

        let found = b.get_many("nums", ["a", "b", "c", "a"]).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["a"].level(), Level::L2);
        assert_eq!(found["b"].value(), Some(&json!(2)));
        assert!(!found.contains_key("c"));

        let again = b.get_many("nums", ["a", "b"]).await.unwrap();
        assert!(again.values().all(|e| e.level() == Level::L1));

        let local = a.get_many("nums", Vec::<String>::new()).await.unwrap();
        assert!(local.is_empty());

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_batch_read_with_absence() {
        let config = CacheConfig {
            cache_absence: true,
            ..CacheConfig::local()
        };
        let cache = TieredCache::new(config).await.unwrap();
        cache.set("r", "x", &json!("x")).await.unwrap();

        let found = cache.get_many("r", ["x", "y"]).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found["y"].is_absent());
        assert_eq!(found["y"].level(), Level::L2);
        cache.close().await;
    }

    #[tokio::test]
    async fn test_idempotent_clear() {
        let cache = TieredCache::new(CacheConfig::local()).await.unwrap();
        cache.set("r", "a", &json!(1)).await.unwrap();
        cache.clear("r").await.unwrap();
        cache.clear("r").await.unwrap();
        assert!(cache.keys("r").await.unwrap().is_empty());
        assert!(cache.get("r", "a").await.unwrap().is_miss());
        cache.close().await;
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let cache = TieredCache::new(CacheConfig::local()).await.unwrap();
        assert_eq!(cache.transport_state(), TransportState::Connected);
        cache.close().await;
        cache.close().await;

        assert!(cache.is_closed());
        assert_eq!(cache.transport_state(), TransportState::Disconnected);
        assert!(matches!(
            cache.get("r", "a").await,
            Err(CacheError::ChannelClosed)
        ));
        assert!(matches!(
            cache.set("r", "a", &1).await,
            Err(CacheError::ChannelClosed)
        ));
        assert!(matches!(cache.regions(), Err(CacheError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_corrupt_l2_entry_is_dropped() {
        let store = MemoryStore::new();
        let bus = BroadcastBus::default();
        let (a, _) = node(&store, &bus, shared_config(), true).await;

        let raw = MemoryLevel2Provider::new(store.clone(), true)
            .build_cache("users")
            .await
            .unwrap();
        raw.set_bytes("bad", b"{not json".to_vec(), 0).await.unwrap();

        let entry = a.get("users", "bad").await.unwrap();
        assert!(entry.is_miss());
        assert_eq!(raw.get_bytes("bad").await.unwrap(), None);
        a.close().await;
    }

    #[tokio::test]
    async fn test_l2_outage() {
        let store = MemoryStore::new();
        let bus = BroadcastBus::default();
        let (a, _) = node(&store, &bus, shared_config(), true).await;
        a.set("r", "cached", &json!(1)).await.unwrap();

        store.set_available(false);
        assert_eq!(a.get("r", "cached").await.unwrap().level(), Level::L1);
        assert!(a.get("r", "other").await.unwrap().is_miss());
        assert!(a.set("r", "x", &json!(2)).await.unwrap_err().is_unavailable());

        store.set_available(true);
        a.close().await;
    }

    #[tokio::test]
    async fn test_broadcast_choices() {
        let config = CacheConfig {
            broadcast_on_set: false,
            ..CacheConfig::local()
        };
        let (cache, transport) = recording_node(config).await;

        cache
            .set_with("r", "quiet", &1, WriteOptions::default().without_broadcast())
            .await
            .unwrap();
        assert!(transport.published().is_empty());

        cache.set("r", "loud", &2).await.unwrap();
        cache.evict("r", ["loud", "quiet"]).await.unwrap();
        cache.evict("r", Vec::<String>::new()).await.unwrap();
        cache.clear("r").await.unwrap();

        let sent = transport.published();
        let ops: Vec<Operator> = sent.iter().map(|c| c.operator).collect();
        assert_eq!(
            ops,
            vec![Operator::EvictKey, Operator::EvictKey, Operator::ClearRegion]
        );
        assert_eq!(sent[1].keys, vec!["loud".to_owned(), "quiet".to_owned()]);
        cache.close().await;
    }

    #[tokio::test]
    async fn test_broadcast_on_set_overrides_option() {
        let (cache, transport) = recording_node(CacheConfig::local()).await;
        cache
            .set_with("r", "k", &1, WriteOptions::default().without_broadcast())
            .await
            .unwrap();
        assert_eq!(transport.published().len(), 1);
        cache.close().await;
    }

    #[tokio::test]
    async fn test_get_or_load_coalesces() {
        let cache = TieredCache::new(CacheConfig::local()).await.unwrap();
        let loader = CountingLoader {
            calls: AtomicUsize::new(0),
            value: Some(json!({"id": 1})),
        };

        let loads = (0..5).map(|_| cache.get_or_load("users", "1", &loader));
        let results = futures::future::join_all(loads).await;
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        for result in results {
            let entry = result.unwrap();
            assert_eq!(entry.level(), Level::Outer);
            assert_eq!(entry.value(), Some(&json!({"id": 1})));
        }

        let cached = cache.get_or_load("users", "1", &loader).await.unwrap();
        assert_eq!(cached.level(), Level::L1);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        cache.close().await;
    }

    #[tokio::test]
    async fn test_get_or_load_caches_absence() {
        let config = CacheConfig {
            cache_absence: true,
            ..CacheConfig::local()
        };
        let cache = TieredCache::new(config).await.unwrap();
        let loader = CountingLoader {
            calls: AtomicUsize::new(0),
            value: None,
        };

        let first = cache.get_or_load("users", "ghost", &loader).await.unwrap();
        assert!(first.is_absent());
        let second = cache.get_or_load("users", "ghost", &loader).await.unwrap();
        assert!(second.is_absent());
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        cache.close().await;
    }

    #[tokio::test]
    async fn test_build_failures() {
        let config = CacheConfig {
            broadcast: "carrier-pigeon".into(),
            ..CacheConfig::local()
        };
        assert!(matches!(
            TieredCache::new(config).await.err().unwrap(),
            CacheError::UnknownTransport(_)
        ));

        let config = CacheConfig {
            serialization: "fst".into(),
            ..CacheConfig::local()
        };
        assert!(matches!(
            TieredCache::new(config).await.err().unwrap(),
            CacheError::Config(_)
        ));

        let config = CacheConfig {
            l1_provider: "memory".into(),
            ..CacheConfig::local()
        };
        assert!(matches!(
            TieredCache::new(config).await.err().unwrap(),
            CacheError::ProviderLevelMismatch { .. }
        ));
    }
}
