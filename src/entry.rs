//! Cached item and region descriptors
//!
//! A [`CacheEntry`] is the transient result of a facade read or write: it
//! names the region and key, carries the value and records which level
//! produced it. Stores never hold this wrapper; L1 holds [`CachedValue`]s and
//! L2 holds serialized bytes.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::CacheError;

/// The level a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    /// Process-local store
    L1,
    /// Shared store
    L2,
    /// Loaded from outside both levels by a [`crate::DataLoader`]
    Outer,
}

impl Level {
    pub fn code(self) -> u8 {
        match self {
            Level::L1 => 1,
            Level::L2 => 2,
            Level::Outer => 3,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// What L1 stores for a key.
///
/// `Absent` is the absence sentinel: a lookup already confirmed there is no
/// value, which is different from the key not being cached at all.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Absent,
    Present(Arc<serde_json::Value>),
}

impl CachedValue {
    pub fn present(value: serde_json::Value) -> Self {
        CachedValue::Present(Arc::new(value))
    }

    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match self {
            CachedValue::Absent => None,
            CachedValue::Present(v) => Some(v),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, CachedValue::Absent)
    }
}

/// One read/write result.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    region: String,
    key: String,
    value: Option<CachedValue>,
    level: Level,
}

impl CacheEntry {
    pub(crate) fn new(
        region: impl Into<String>,
        key: impl Into<String>,
        level: Level,
        value: Option<CachedValue>,
    ) -> Self {
        Self {
            region: region.into(),
            key: key.into(),
            value,
            level,
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// The cached value, `None` both for a miss and for the absence sentinel.
    pub fn value(&self) -> Option<&serde_json::Value> {
        self.value.as_ref().and_then(CachedValue::as_value)
    }

    /// The raw slot, keeping the sentinel visible.
    pub fn raw(&self) -> Option<&CachedValue> {
        self.value.as_ref()
    }

    /// Neither level had anything for this key.
    pub fn is_miss(&self) -> bool {
        self.value.is_none()
    }

    /// The key is known to have no value.
    pub fn is_absent(&self) -> bool {
        matches!(self.value, Some(CachedValue::Absent))
    }

    /// Decode the value into a concrete type.
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<Option<T>, CacheError> {
        match self.value() {
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| CacheError::Deserialize(e.to_string())),
            None => Ok(None),
        }
    }
}

impl fmt::Display for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Some(v) => write!(f, "[{},{},L{}]=>{}", self.region, self.key, self.level, v),
            None => write!(f, "[{},{},L{}]=>null", self.region, self.key, self.level),
        }
    }
}

/// Snapshot of a live L1 region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    /// Maximum element count held in L1
    pub capacity: u64,
    /// Time-to-live in seconds, 0 means no expiry
    pub ttl_seconds: u64,
}

impl Region {
    pub fn new(name: impl Into<String>, capacity: u64, ttl_seconds: u64) -> Self {
        Self {
            name: name.into(),
            capacity,
            ttl_seconds,
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},size:{},ttl:{}]",
            self.name, self.capacity, self.ttl_seconds
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_absence_differs_from_miss() {
        let miss = CacheEntry::new("users", "1", Level::L2, None);
        let absent = CacheEntry::new("users", "1", Level::L1, Some(CachedValue::Absent));

        assert!(miss.is_miss());
        assert!(!miss.is_absent());
        assert!(absent.is_absent());
        assert!(!absent.is_miss());
        assert_eq!(miss.value(), None);
        assert_eq!(absent.value(), None);
    }

    #[test]
    fn test_value_as() {
        #[derive(Deserialize, Debug, PartialEq)]
        struct User {
            name: String,
        }

        let entry = CacheEntry::new(
            "users",
            "42",
            Level::L1,
            Some(CachedValue::present(json!({"name": "a"}))),
        );
        let user: Option<User> = entry.value_as().unwrap();
        assert_eq!(user, Some(User { name: "a".into() }));

        let wrong: Result<Option<u64>, _> = entry.value_as();
        assert!(matches!(wrong, Err(CacheError::Deserialize(_))));
    }

    #[test]
    fn test_display() {
        let entry = CacheEntry::new("r", "k", Level::L2, Some(CachedValue::present(json!(7))));
        assert_eq!(entry.to_string(), "[r,k,L2]=>7");
        assert_eq!(Region::new("r", 10, 60).to_string(), "[r,size:10,ttl:60]");
    }
}
