//! In-process broadcast bus.
//!
//! Every [`BusTransport`] created from one [`BroadcastBus`] sees the JSON
//! payloads the others publish, which lets several cache nodes share one
//! process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ClusterTransport, CommandDispatcher, StateCell, TransportState};
use crate::command::{Command, SourceId};
use crate::registry::ProviderRegistry;
use crate::CacheError;

#[derive(Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<String>,
}

impl BroadcastBus {
    /// `capacity` payloads may be buffered per subscriber before the slowest
    /// one starts losing messages.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn transport(&self, source: SourceId) -> BusTransport {
        BusTransport {
            bus: self.clone(),
            source,
            state: StateCell::new(),
            shutdown: watch::channel(false).0,
            task: Mutex::new(None),
            handled: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

pub struct BusTransport {
    bus: BroadcastBus,
    source: SourceId,
    state: StateCell,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    handled: Arc<AtomicU64>,
}

impl BusTransport {
    /// Payloads taken off the bus so far, including our own and malformed ones.
    pub fn handled_count(&self) -> u64 {
        self.handled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterTransport for BusTransport {
    fn name(&self) -> &str {
        "bus"
    }

    fn source(&self) -> SourceId {
        self.source
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    async fn connect(&self, registry: Arc<ProviderRegistry>) -> Result<(), CacheError> {
        if self.state.get() != TransportState::Disconnected {
            return Ok(());
        }
        self.state.set(TransportState::Connecting);

        let dispatcher = CommandDispatcher::new(self.source, registry);
        let mut rx = self.bus.tx.subscribe();
        self.shutdown.send_replace(false);
        let mut shutdown = self.shutdown.subscribe();
        let handled = Arc::clone(&self.handled);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = rx.recv() => match received {
                        Ok(payload) => {
                            dispatcher.dispatch_payload(&payload).await;
                            handled.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Bus receiver lagged, {} commands lost", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("Bus receive loop stopped");
        });
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }

        self.publish(Command::join()).await?;
        self.state.set(TransportState::Connected);
        Ok(())
    }

    async fn publish(&self, cmd: Command) -> Result<(), CacheError> {
        let payload = cmd.stamped(self.source).to_json()?;
        // no subscribers is not an error
        if self.bus.tx.send(payload).is_err() {
            debug!("No bus subscribers");
        }
        Ok(())
    }

    async fn disconnect(&self) {
        if self.state.get() == TransportState::Disconnected {
            return;
        }
        if let Err(e) = self.publish(Command::quit()).await {
            warn!("Failed to announce quit: {}", e);
        }
        self.shutdown.send_replace(true);
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = task {
            let _ = handle.await;
        }
        self.state.set(TransportState::Disconnected);
    }
}
