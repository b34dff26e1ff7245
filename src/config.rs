//! Cache configuration

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::CacheError;

const PREFIX: &str = "tiercache.";

/// Flat string settings for a provider or transport.
///
/// Keys are stored without the provider prefix, e.g. `redis.hosts` in a flat
/// map becomes `hosts` in the L2 provider's properties. Read from TOML, a
/// properties table may nest: `[l1_properties.region]` with `users = ".."`
/// yields the key `region.users`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into().trim().to_owned());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Parse a value, falling back to `default` when the key is missing.
    pub fn parse_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, CacheError> {
        match self.get(key) {
            Some(raw) => raw
                .parse()
                .map_err(|_| CacheError::Config(format!("invalid value for {key}: '{raw}'"))),
            None => Ok(default),
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, CacheError> {
        match self.get(key).map(str::to_ascii_lowercase).as_deref() {
            None => Ok(default),
            Some("true") | Some("yes") | Some("1") => Ok(true),
            Some("false") | Some("no") | Some("0") => Ok(false),
            Some(other) => Err(CacheError::Config(format!(
                "invalid boolean for {key}: '{other}'"
            ))),
        }
    }

    /// Entries under `prefix.`, with the prefix stripped.
    pub fn sub(&self, prefix: &str) -> Properties {
        let prefix = format!("{prefix}.");
        Properties(
            self.0
                .iter()
                .filter_map(|(k, v)| {
                    k.strip_prefix(prefix.as_str())
                        .map(|rest| (rest.to_owned(), v.clone()))
                })
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One TOML value inside a properties table. Nested tables are flattened
/// into dotted keys.
#[derive(Deserialize)]
#[serde(untagged)]
enum Setting {
    Flag(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Table(BTreeMap<String, Setting>),
}

impl Setting {
    fn flatten_into(self, key: String, out: &mut Properties) {
        match self {
            Setting::Flag(v) => out.insert(key, v.to_string()),
            Setting::Int(v) => out.insert(key, v.to_string()),
            Setting::Float(v) => out.insert(key, v.to_string()),
            Setting::Text(v) => out.insert(key, v),
            Setting::Table(table) => {
                for (sub, value) in table {
                    value.flatten_into(format!("{key}.{sub}"), out);
                }
            }
        }
    }
}

impl<'de> Deserialize<'de> for Properties {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let table = BTreeMap::<String, Setting>::deserialize(deserializer)?;
        let mut props = Properties::new();
        for (key, value) in table {
            value.flatten_into(key, &mut props);
        }
        Ok(props)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut props = Properties::new();
        for (k, v) in iter {
            props.insert(k, v);
        }
        props
    }
}

/// Configuration for the two-level cache
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Name of the L1 (local) provider
    pub l1_provider: String,
    pub l1_properties: Properties,
    /// Name of the L2 (shared) provider
    pub l2_provider: String,
    pub l2_properties: Properties,
    /// Name of the cluster transport
    pub broadcast: String,
    pub broadcast_properties: Properties,
    /// Serializer used for L2 values
    pub serialization: String,
    /// Pass per-write TTLs through to L2
    pub sync_ttl_to_l2: bool,
    /// Remember confirmed misses in L1
    pub cache_absence: bool,
    /// Broadcast every write, ignoring the per-call flag
    pub broadcast_on_set: bool,
    /// Upper bound for transport connect/publish calls
    #[serde(rename = "transport_timeout_ms", deserialize_with = "millis")]
    pub transport_timeout: Duration,
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_provider: "moka".to_owned(),
            l1_properties: Properties::new(),
            l2_provider: "redis".to_owned(),
            l2_properties: Properties::new(),
            broadcast: "redis".to_owned(),
            broadcast_properties: Properties::new(),
            serialization: "json".to_owned(),
            sync_ttl_to_l2: true,
            cache_absence: false,
            broadcast_on_set: true,
            transport_timeout: Duration::from_secs(5),
        }
    }
}

impl CacheConfig {
    /// Single-process setup: moka L1, in-memory L2, no broadcast.
    pub fn local() -> Self {
        Self {
            l2_provider: "memory".to_owned(),
            broadcast: "none".to_owned(),
            ..Self::default()
        }
    }

    /// Build from flat properties (`tiercache.*` keys plus per-provider sections).
    pub fn from_properties(props: &Properties) -> Result<Self, CacheError> {
        let defaults = Self::default();
        let key = |k: &str| format!("{PREFIX}{k}");

        let l1_provider = props
            .get_or(&key("L1.provider"), &defaults.l1_provider)
            .to_owned();
        let l2_provider = props
            .get_or(&key("L2.provider"), &defaults.l2_provider)
            .to_owned();
        let l2_section = props
            .get_or(&key("L2.config_section"), &l2_provider)
            .to_owned();
        let broadcast = props
            .get_or(&key("broadcast"), &defaults.broadcast)
            .to_owned();
        let timeout_ms = props.parse_or(
            &key("transport_timeout_ms"),
            defaults.transport_timeout.as_millis() as u64,
        )?;

        Ok(Self {
            l1_properties: props.sub(&l1_provider),
            l2_properties: props.sub(&l2_section),
            broadcast_properties: props.sub(&broadcast),
            serialization: props
                .get_or(&key("serialization"), &defaults.serialization)
                .to_owned(),
            sync_ttl_to_l2: props.bool_or(&key("sync_ttl_to_l2"), defaults.sync_ttl_to_l2)?,
            cache_absence: props.bool_or(&key("cache_absence"), defaults.cache_absence)?,
            broadcast_on_set: props
                .bool_or(&key("broadcast_on_set"), defaults.broadcast_on_set)?,
            transport_timeout: Duration::from_millis(timeout_ms),
            l1_provider,
            l2_provider,
            broadcast,
        })
    }

    /// Parse a TOML document. Missing fields keep their defaults.
    pub fn from_toml(text: &str) -> Result<Self, CacheError> {
        toml::from_str(text).map_err(|e| CacheError::Config(format!("TOML parse error: {e}")))
    }

    /// Read a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CacheError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
broadcast = "redis"
l1_provider = "moka"
l2_provider = "readonly-redis"
cache_absence = true
transport_timeout_ms = 1500

[l1_properties]
housekeeping_ms = 500

[l1_properties.region]
default = "1000, 30m"
users = "50, 60s"

[l2_properties]
hosts = "10.0.0.1:6379"
timeout = 2000

[broadcast_properties]
channel = "cache-events"
"#;

    #[test]
    fn test_from_toml() {
        let config = CacheConfig::from_toml(SAMPLE).unwrap();

        assert_eq!(config.l1_provider, "moka");
        assert_eq!(config.l2_provider, "readonly-redis");
        assert_eq!(config.broadcast, "redis");
        assert!(config.cache_absence);
        assert!(config.sync_ttl_to_l2);
        assert_eq!(config.serialization, "json");
        assert_eq!(config.transport_timeout, Duration::from_millis(1500));
        assert_eq!(config.l1_properties.get("region.users"), Some("50, 60s"));
        assert_eq!(config.l1_properties.get("housekeeping_ms"), Some("500"));
        assert_eq!(config.l2_properties.parse_or("timeout", 0u64).unwrap(), 2000);
        assert_eq!(config.broadcast_properties.get("channel"), Some("cache-events"));
    }

    #[test]
    fn test_from_toml_errors() {
        assert!(matches!(
            CacheConfig::from_toml("cache_absence = \"maybe\""),
            Err(CacheError::Config(_))
        ));
        assert!(CacheConfig::from_toml("[l1_properties\n").is_err());
        assert!(matches!(
            CacheConfig::from_file("/nonexistent/tiercache.toml"),
            Err(CacheError::Config(_))
        ));
    }

    #[test]
    fn test_from_properties() {
        let props: Properties = [
            ("tiercache.broadcast", "redis"),
            ("tiercache.L2.provider", "readonly-redis"),
            ("tiercache.L2.config_section", "redis"),
            ("tiercache.cache_absence", "TRUE"),
            ("tiercache.transport_timeout_ms", "1500"),
            ("moka.region.users", "50, 60s"),
            ("redis.hosts", "10.0.0.1:6379"),
            ("redis.channel", "cache-events"),
        ]
        .into_iter()
        .collect();
        let config = CacheConfig::from_properties(&props).unwrap();

        assert_eq!(config.l1_provider, "moka");
        assert_eq!(config.l2_provider, "readonly-redis");
        assert!(config.cache_absence);
        assert_eq!(config.transport_timeout, Duration::from_millis(1500));
        assert_eq!(config.l1_properties.get("region.users"), Some("50, 60s"));
        assert_eq!(config.l2_properties.get("hosts"), Some("10.0.0.1:6379"));
        // the transport shares the redis section
        assert_eq!(config.broadcast_properties.get("channel"), Some("cache-events"));
    }

    #[test]
    fn test_defaults() {
        let config = CacheConfig::from_toml("").unwrap();
        assert_eq!(config.l1_provider, "moka");
        assert_eq!(config.l2_provider, "redis");
        assert!(!config.cache_absence);
        assert!(config.broadcast_on_set);
        assert_eq!(config.transport_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_values() {
        let props = Properties::new().with("tiercache.cache_absence", "maybe");
        assert!(matches!(
            CacheConfig::from_properties(&props),
            Err(CacheError::Config(_))
        ));

        let props = Properties::new().with("port", "x");
        assert!(props.parse_or("port", 6379u16).is_err());
        assert_eq!(Properties::new().parse_or("port", 6379u16).unwrap(), 6379);
    }
}
