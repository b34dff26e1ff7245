//! tiercache - Two-level caching library with cluster invalidation
//!
//! This library provides a region/key cache built from two levels:
//! - L1: process-local store (Moka by default)
//! - L2: shared store (Redis by default), the source of truth across nodes
//!
//! The cache supports:
//! - Read-through from L2 with write-back into L1
//! - Broadcast invalidation so other nodes drop stale L1 copies
//! - L1 expiry cascading into L2 cleanup
//! - Optional caching of confirmed absence
//! - Pluggable providers and transports registered by name

mod config;
mod context;
mod entry;
mod error;
mod registry;
mod serializer;
mod tiered_cache;

pub mod cluster;
pub mod command;
pub mod tier;

pub use cluster::{
    BroadcastBus, BusTransport, ClusterTransport, CommandDispatcher, NoneTransport,
    RedisPubSubTransport, TransportFactories, TransportState,
};
pub use command::{Command, Operator, SourceId};
pub use config::{CacheConfig, Properties};
pub use context::NodeContext;
pub use entry::{CacheEntry, CachedValue, Level, Region};
pub use error::CacheError;
pub use registry::{Level1Factory, Level2Factory, ProviderFactories, ProviderRegistry};
pub use serializer::{JsonSerializer, Serializer, serializer_for};
pub use tiered_cache::{DataLoader, TieredCache, TieredCacheBuilder, WriteOptions};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
