//! L1 backed by Moka, one cache per region.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ::moka::future::Cache;
use ::moka::notification::RemovalCause;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ExpirationListener, Level1Cache, Level1Provider, clamp_ttl, parse_ttl_seconds};
use crate::config::Properties;
use crate::entry::{CachedValue, Region};
use crate::CacheError;

const DEFAULT_CAPACITY: u64 = 1000;
const DEFAULT_TTL_SECONDS: u64 = 30 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RegionShape {
    capacity: u64,
    ttl_seconds: u64,
}

impl RegionShape {
    /// `"<capacity>, <ttl>"`
    fn parse(raw: &str) -> Result<Self, CacheError> {
        let mut parts = raw.split(',');
        let capacity = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CacheError::Config(format!("invalid region definition '{raw}'")))?
            .parse()
            .map_err(|_| CacheError::Config(format!("invalid region capacity in '{raw}'")))?;
        let ttl_seconds = match parts.next() {
            Some(ttl) => parse_ttl_seconds(ttl)?,
            None => 0,
        };
        Ok(Self {
            capacity,
            ttl_seconds,
        })
    }
}

/// One region's Moka cache.
pub struct MokaRegion {
    name: String,
    cache: Cache<String, CachedValue>,
    shape: RegionShape,
}

impl MokaRegion {
    fn new(name: &str, shape: RegionShape, listener: ExpirationListener) -> Self {
        let region = name.to_owned();
        let mut builder = Cache::builder()
            .max_capacity(shape.capacity)
            .eviction_listener(move |key: Arc<String>, _value, cause| {
                // explicit evictions and replacements are ours, not expiries
                if cause == RemovalCause::Expired {
                    listener.notify_expired(&region, &key);
                }
            });
        if shape.ttl_seconds > 0 {
            builder = builder.time_to_live(Duration::from_secs(shape.ttl_seconds));
        }

        Self {
            name: name.to_owned(),
            cache: builder.build(),
            shape,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Flush Moka's pending maintenance, which is where expirations are reported.
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

#[async_trait]
impl Level1Cache for MokaRegion {
    async fn get(&self, key: &str) -> Result<Option<CachedValue>, CacheError> {
        Ok(self.cache.get(key).await)
    }

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, CachedValue>, CacheError> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.cache.get(key).await {
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }

    async fn put(&self, key: &str, value: CachedValue) -> Result<(), CacheError> {
        self.cache.insert(key.to_owned(), value).await;
        Ok(())
    }

    async fn put_many(&self, values: HashMap<String, CachedValue>) -> Result<(), CacheError> {
        for (key, value) in values {
            self.cache.insert(key, value).await;
        }
        Ok(())
    }

    async fn keys(&self) -> Result<HashSet<String>, CacheError> {
        Ok(self.cache.iter().map(|(k, _)| (*k).clone()).collect())
    }

    async fn evict(&self, keys: &[String]) -> Result<(), CacheError> {
        for key in keys {
            self.cache.invalidate(key).await;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.cache.invalidate_all();
        Ok(())
    }

    fn ttl_seconds(&self) -> u64 {
        self.shape.ttl_seconds
    }

    fn capacity(&self) -> u64 {
        self.shape.capacity
    }
}

/// Moka L1 provider.
///
/// Region shapes come from `region.<name> = <capacity>, <ttl>` properties;
/// `region.default` applies to regions without their own line. A background
/// task runs Moka maintenance every `housekeeping_ms` (default 1000) so that
/// idle regions still report expirations.
pub struct MokaProvider {
    regions: Arc<DashMap<String, Arc<MokaRegion>>>,
    shapes: HashMap<String, RegionShape>,
    default_shape: RegionShape,
    housekeeping: Mutex<Option<JoinHandle<()>>>,
}

impl MokaProvider {
    /// Must be called inside a tokio runtime (spawns the housekeeping task).
    pub fn from_properties(props: &Properties) -> Result<Self, CacheError> {
        let mut shapes = HashMap::new();
        let mut default_shape = RegionShape {
            capacity: DEFAULT_CAPACITY,
            ttl_seconds: DEFAULT_TTL_SECONDS,
        };
        for (key, value) in props.iter() {
            if let Some(region) = key.strip_prefix("region.") {
                let shape = RegionShape::parse(value)?;
                if region == "default" {
                    default_shape = shape;
                } else {
                    shapes.insert(region.to_owned(), shape);
                }
            }
        }
        let interval = Duration::from_millis(props.parse_or("housekeeping_ms", 1000u64)?.max(10));

        let regions: Arc<DashMap<String, Arc<MokaRegion>>> = Arc::new(DashMap::new());
        let handle = tokio::spawn({
            let regions = Arc::downgrade(&regions);
            async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let Some(regions) = regions.upgrade() else {
                        break;
                    };
                    let live: Vec<Arc<MokaRegion>> =
                        regions.iter().map(|r| Arc::clone(r.value())).collect();
                    drop(regions);
                    for region in live {
                        region.run_pending_tasks().await;
                    }
                }
            }
        });

        Ok(Self {
            regions,
            shapes,
            default_shape,
            housekeeping: Mutex::new(Some(handle)),
        })
    }

    /// Concrete handle, mainly for maintenance.
    pub fn region(&self, name: &str) -> Option<Arc<MokaRegion>> {
        self.regions.get(name).map(|r| Arc::clone(r.value()))
    }

    fn shape_for(&self, region: &str, ttl_seconds: Option<u64>) -> RegionShape {
        let base = self
            .shapes
            .get(region)
            .copied()
            .unwrap_or(self.default_shape);
        match ttl_seconds {
            Some(ttl) if ttl > 0 => RegionShape {
                ttl_seconds: clamp_ttl(ttl),
                ..base
            },
            _ => base,
        }
    }
}

#[async_trait]
impl Level1Provider for MokaProvider {
    fn name(&self) -> &str {
        "moka"
    }

    async fn build_cache(
        &self,
        region: &str,
        ttl_seconds: Option<u64>,
        listener: ExpirationListener,
    ) -> Result<Arc<dyn Level1Cache>, CacheError> {
        if let Some(existing) = self.regions.get(region) {
            if let Some(ttl) = ttl_seconds
                && ttl > 0
                && ttl != existing.shape.ttl_seconds
            {
                warn!(
                    "Region [{}] already exists with ttl {}s, requested {}s ignored",
                    region, existing.shape.ttl_seconds, ttl
                );
            }
            return Ok(Arc::clone(existing.value()) as Arc<dyn Level1Cache>);
        }

        let shape = self.shape_for(region, ttl_seconds);
        let created = self
            .regions
            .entry(region.to_owned())
            .or_insert_with(|| {
                debug!(
                    "Creating L1 region [{}] capacity={} ttl={}s",
                    region, shape.capacity, shape.ttl_seconds
                );
                Arc::new(MokaRegion::new(region, shape, listener))
            })
            .value()
            .clone();
        Ok(created as Arc<dyn Level1Cache>)
    }

    fn regions(&self) -> Vec<Region> {
        self.regions
            .iter()
            .map(|r| Region::new(r.key().clone(), r.shape.capacity, r.shape.ttl_seconds))
            .collect()
    }

    fn remove_cache(&self, region: &str) {
        if let Some((_, removed)) = self.regions.remove(region) {
            removed.cache.invalidate_all();
        }
    }

    async fn stop(&self) {
        if let Ok(mut guard) = self.housekeeping.lock()
            && let Some(handle) = guard.take()
        {
            handle.abort();
        }
        for region in self.regions.iter() {
            region.cache.invalidate_all();
        }
        self.regions.clear();
        info!("Moka L1 provider stopped");
    }
}
