//! Cluster invalidation
//!
//! A transport carries [`Command`]s between nodes. Received commands go
//! through a [`CommandDispatcher`], which drops our own broadcasts and
//! applies the rest to the local L1 only.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, info};

use crate::command::{Command, Operator, SourceId};
use crate::config::CacheConfig;
use crate::context::NodeContext;
use crate::registry::ProviderRegistry;
use crate::CacheError;

pub mod bus;
pub mod none;
pub mod redis;

pub use self::bus::{BroadcastBus, BusTransport};
pub use self::none::NoneTransport;
pub use self::redis::RedisPubSubTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
}

/// Atomic holder for a [`TransportState`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        StateCell(AtomicU8::new(0))
    }

    pub(crate) fn get(&self) -> TransportState {
        match self.0.load(Ordering::SeqCst) {
            1 => TransportState::Connecting,
            2 => TransportState::Connected,
            _ => TransportState::Disconnected,
        }
    }

    pub(crate) fn set(&self, state: TransportState) {
        let raw = match state {
            TransportState::Disconnected => 0,
            TransportState::Connecting => 1,
            TransportState::Connected => 2,
        };
        self.0.store(raw, Ordering::SeqCst);
    }
}

/// Broadcast channel between cache nodes.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Id stamped on every outgoing command.
    fn source(&self) -> SourceId;

    fn state(&self) -> TransportState;

    /// Join the cluster and start receiving. Received commands are applied
    /// through `registry`.
    async fn connect(&self, registry: Arc<ProviderRegistry>) -> Result<(), CacheError>;

    /// Send `cmd` to every node, stamped with [`source`](Self::source).
    async fn publish(&self, cmd: Command) -> Result<(), CacheError>;

    /// Announce departure and stop receiving. Never fails.
    async fn disconnect(&self);

    async fn send_evict_cmd(&self, region: &str, keys: Vec<String>) -> Result<(), CacheError> {
        self.publish(Command::evict(region, keys)).await
    }

    async fn send_clear_cmd(&self, region: &str) -> Result<(), CacheError> {
        self.publish(Command::clear(region)).await
    }
}

/// Applies received commands to this node.
#[derive(Clone)]
pub struct CommandDispatcher {
    source: SourceId,
    registry: Arc<ProviderRegistry>,
}

impl CommandDispatcher {
    pub fn new(source: SourceId, registry: Arc<ProviderRegistry>) -> Self {
        Self { source, registry }
    }

    pub fn is_local_command(&self, cmd: &Command) -> bool {
        cmd.source == self.source
    }

    /// Handle one received command. `None` (an unparseable payload) and our
    /// own commands are ignored. Failures are logged, never returned.
    pub async fn dispatch(&self, cmd: Option<Command>) {
        let Some(cmd) = cmd else {
            return;
        };
        if self.is_local_command(&cmd) {
            return;
        }
        match AssertUnwindSafe(self.apply(&cmd)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Failed to handle received command {:?}: {}", cmd, e),
            Err(_) => error!("Handler panicked on received command {:?}", cmd),
        }
    }

    /// Parse and dispatch a text payload.
    pub async fn dispatch_payload(&self, payload: &str) {
        self.dispatch(Command::parse(payload)).await;
    }

    async fn apply(&self, cmd: &Command) -> Result<(), CacheError> {
        match cmd.operator {
            Operator::Join => info!("Node-{} joined to cluster", cmd.source),
            Operator::Quit => info!("Node-{} quit from cluster", cmd.source),
            Operator::EvictKey => {
                self.registry.evict_local(&cmd.region, &cmd.keys).await?;
                debug!(
                    "Received cache evict message, region={},key={}",
                    cmd.region,
                    cmd.keys.join(",")
                );
            }
            Operator::ClearRegion => {
                self.registry.clear_local(&cmd.region).await?;
                debug!("Received cache clear message, region={}", cmd.region);
            }
        }
        Ok(())
    }
}

pub type TransportFactory = Arc<
    dyn Fn(&CacheConfig, &NodeContext) -> Result<Arc<dyn ClusterTransport>, CacheError>
        + Send
        + Sync,
>;

/// Name -> transport constructor.
#[derive(Clone, Default)]
pub struct TransportFactories {
    factories: HashMap<String, TransportFactory>,
}

impl TransportFactories {
    pub fn empty() -> Self {
        Self::default()
    }

    /// `none` and `redis`.
    pub fn with_builtins() -> Self {
        let mut factories = Self::empty();
        factories
            .register("none", |_, ctx| {
                Ok(Arc::new(NoneTransport::new(ctx.source())) as Arc<dyn ClusterTransport>)
            })
            .register("redis", |config, ctx| {
                Ok(Arc::new(RedisPubSubTransport::from_properties(
                    &config.broadcast_properties,
                    ctx.source(),
                    config.transport_timeout,
                )?) as Arc<dyn ClusterTransport>)
            });
        factories
    }

    pub fn register<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(&CacheConfig, &NodeContext) -> Result<Arc<dyn ClusterTransport>, CacheError>
            + Send
            + Sync
            + 'static,
    {
        self.factories
            .insert(name.trim().to_ascii_lowercase(), Arc::new(factory));
        self
    }

    pub fn create(
        &self,
        name: &str,
        config: &CacheConfig,
        ctx: &NodeContext,
    ) -> Result<Arc<dyn ClusterTransport>, CacheError> {
        let factory = self
            .factories
            .get(&name.trim().to_ascii_lowercase())
            .ok_or_else(|| CacheError::UnknownTransport(name.to_owned()))?;
        factory(config, ctx)
    }
}
