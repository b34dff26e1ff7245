//! L2 backed by Redis
//!
//! Two storage layouts:
//! - `generic`: one Redis key per entry (`namespace:region:key`), native TTL
//!   through `SETEX`, enumeration through `SCAN`.
//! - `hash`: one Redis hash per region. Hash fields cannot expire on their
//!   own, so this layout reports no TTL support.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, RedisResult};
use async_trait::async_trait;
use tracing::{debug, info};

use super::{Level2Cache, Level2Provider, clamp_ttl};
use crate::config::Properties;
use crate::CacheError;

const DEFAULT_REGION: &str = "_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Generic,
    Hash,
}

impl Storage {
    fn parse(raw: &str) -> Result<Self, CacheError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "generic" => Ok(Storage::Generic),
            "hash" => Ok(Storage::Hash),
            other => Err(CacheError::Config(format!("unknown redis storage '{other}'"))),
        }
    }
}

/// Build a connection URL from `url`, or from `hosts`, `password`,
/// `database` and `ssl`. Only single-server deployments are supported, so a
/// `hosts` list naming several servers is a configuration error.
pub fn connection_url(props: &Properties) -> Result<String, CacheError> {
    if let Some(url) = props.get("url") {
        return Ok(url.to_owned());
    }
    let hosts: Vec<&str> = props
        .get_or("hosts", "127.0.0.1:6379")
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .collect();
    let host = match hosts.as_slice() {
        [] => "127.0.0.1:6379",
        [host] => *host,
        _ => {
            return Err(CacheError::Config(format!(
                "{} redis hosts configured, only a single server is supported",
                hosts.len()
            )));
        }
    };
    let host = if host.contains(':') {
        host.to_owned()
    } else {
        format!("{host}:6379")
    };
    let scheme = if props.bool_or("ssl", false)? {
        "rediss"
    } else {
        "redis"
    };
    let database: u32 = props.parse_or("database", 0)?;
    let auth = match props.get("password") {
        Some(password) => format!(":{password}@"),
        None => String::new(),
    };
    Ok(format!("{scheme}://{auth}{host}/{database}"))
}

/// Backslash-escape the glob characters of a SCAN `MATCH` pattern.
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Namespaced region name.
fn region_name(namespace: Option<&str>, region: &str) -> String {
    let region = if region.trim().is_empty() {
        DEFAULT_REGION
    } else {
        region
    };
    match namespace {
        Some(ns) => format!("{ns}:{region}"),
        None => region.to_owned(),
    }
}

async fn bounded<T>(
    timeout: Duration,
    fut: impl Future<Output = RedisResult<T>>,
) -> Result<T, CacheError> {
    Ok(tokio::time::timeout(timeout, fut).await??)
}

/// One Redis key per entry.
pub struct RedisGenericCache {
    conn: ConnectionManager,
    region: String,
    timeout: Duration,
    scan_count: usize,
}

impl RedisGenericCache {
    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.region, key)
    }

    /// Full Redis keys of this region, via SCAN.
    ///
    /// The pattern is `<region>:*`, so a region named `users` also sees the
    /// keys of a region named `users:vip`. Avoid `:` in region names when
    /// using the generic layout.
    async fn scan(&self) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}:*", escape_glob(&self.region));
        let mut cursor: u64 = 0;
        let mut found = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = bounded(
                self.timeout,
                ::redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(self.scan_count)
                    .query_async(&mut conn),
            )
            .await?;
            found.extend(batch);
            if next == 0 {
                return Ok(found);
            }
            cursor = next;
        }
    }
}

#[async_trait]
impl Level2Cache for RedisGenericCache {
    fn supports_ttl(&self) -> bool {
        true
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        bounded(self.timeout, conn.get(self.key(key))).await
    }

    async fn get_many_bytes(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let full: Vec<String> = keys.iter().map(|k| self.key(k)).collect();
        bounded(
            self.timeout,
            ::redis::cmd("MGET").arg(&full).query_async(&mut conn),
        )
        .await
    }

    async fn set_bytes(
        &self,
        key: &str,
        bytes: Vec<u8>,
        ttl_seconds: u64,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let key = self.key(key);
        let ttl_seconds = clamp_ttl(ttl_seconds);
        if ttl_seconds > 0 {
            bounded(self.timeout, conn.set_ex::<_, _, ()>(key, bytes, ttl_seconds)).await
        } else {
            bounded(self.timeout, conn.set::<_, _, ()>(key, bytes)).await
        }
    }

    async fn set_many_bytes(
        &self,
        values: HashMap<String, Vec<u8>>,
        ttl_seconds: u64,
    ) -> Result<(), CacheError> {
        if values.is_empty() {
            return Ok(());
        }
        let ttl_seconds = clamp_ttl(ttl_seconds);
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for (key, bytes) in values {
            if ttl_seconds > 0 {
                pipe.set_ex(self.key(&key), bytes, ttl_seconds).ignore();
            } else {
                pipe.set(self.key(&key), bytes).ignore();
            }
        }
        let mut conn = self.conn.clone();
        bounded(self.timeout, pipe.query_async::<()>(&mut conn)).await
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        bounded(self.timeout, conn.exists(self.key(key))).await
    }

    async fn keys(&self) -> Result<HashSet<String>, CacheError> {
        let skip = self.region.len() + 1;
        Ok(self
            .scan()
            .await?
            .into_iter()
            .filter(|k| k.len() > skip)
            .map(|k| k[skip..].to_owned())
            .collect())
    }

    async fn evict(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let full: Vec<String> = keys.iter().map(|k| self.key(k)).collect();
        bounded(self.timeout, conn.del::<_, ()>(full)).await
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let keys = self.scan().await?;
        let mut conn = self.conn.clone();
        for chunk in keys.chunks(self.scan_count.max(1)) {
            bounded(self.timeout, conn.del::<_, ()>(chunk.to_vec())).await?;
        }
        debug!("Cleared {} keys of region {}", keys.len(), self.region);
        Ok(())
    }
}

/// One Redis hash per region.
pub struct RedisHashCache {
    conn: ConnectionManager,
    hash: String,
    timeout: Duration,
}

#[async_trait]
impl Level2Cache for RedisHashCache {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        bounded(self.timeout, conn.hget(&self.hash, key)).await
    }

    async fn get_many_bytes(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        bounded(
            self.timeout,
            ::redis::cmd("HMGET")
                .arg(&self.hash)
                .arg(keys.to_vec())
                .query_async(&mut conn),
        )
        .await
    }

    async fn set_bytes(&self, key: &str, bytes: Vec<u8>, _ttl: u64) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        bounded(self.timeout, conn.hset::<_, _, _, ()>(&self.hash, key, bytes)).await
    }

    async fn set_many_bytes(
        &self,
        values: HashMap<String, Vec<u8>>,
        _ttl: u64,
    ) -> Result<(), CacheError> {
        if values.is_empty() {
            return Ok(());
        }
        let pairs: Vec<(String, Vec<u8>)> = values.into_iter().collect();
        let mut conn = self.conn.clone();
        bounded(
            self.timeout,
            conn.hset_multiple::<_, _, _, ()>(&self.hash, pairs.as_slice()),
        )
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        bounded(self.timeout, conn.hexists(&self.hash, key)).await
    }

    async fn keys(&self) -> Result<HashSet<String>, CacheError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = bounded(self.timeout, conn.hkeys(&self.hash)).await?;
        Ok(keys.into_iter().collect())
    }

    async fn evict(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        bounded(self.timeout, conn.hdel::<_, _, ()>(&self.hash, keys.to_vec())).await
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        bounded(self.timeout, conn.del::<_, ()>(&self.hash)).await
    }
}

/// Redis L2 provider.
///
/// Properties: `url` or `hosts`/`password`/`database`/`ssl`, `namespace`,
/// `storage` (`generic` | `hash`, default `generic`), `timeout` in ms
/// (default 2000) and `scan_count` (default 1000).
pub struct RedisProvider {
    conn: ConnectionManager,
    namespace: Option<String>,
    storage: Storage,
    timeout: Duration,
    scan_count: usize,
}

impl RedisProvider {
    pub async fn connect(props: &Properties) -> Result<Self, CacheError> {
        let url = connection_url(props)?;
        let storage = Storage::parse(props.get_or("storage", "generic"))?;
        let timeout = Duration::from_millis(props.parse_or("timeout", 2000u64)?);
        let scan_count = props.parse_or("scan_count", 1000usize)?;

        let client = ::redis::Client::open(url)?;
        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client)).await??;
        info!("Connected L2 redis provider ({:?} storage)", storage);

        Ok(Self {
            conn,
            namespace: props.get("namespace").map(str::to_owned),
            storage,
            timeout,
            scan_count,
        })
    }
}

#[async_trait]
impl Level2Provider for RedisProvider {
    fn name(&self) -> &str {
        "redis"
    }

    async fn build_cache(&self, region: &str) -> Result<Arc<dyn Level2Cache>, CacheError> {
        let region = region_name(self.namespace.as_deref(), region);
        Ok(match self.storage {
            Storage::Generic => Arc::new(RedisGenericCache {
                conn: self.conn.clone(),
                region,
                timeout: self.timeout,
                scan_count: self.scan_count,
            }),
            Storage::Hash => Arc::new(RedisHashCache {
                conn: self.conn.clone(),
                hash: region,
                timeout: self.timeout,
            }),
        })
    }

    async fn stop(&self) {
        info!("Redis L2 provider stopped");
    }
}
