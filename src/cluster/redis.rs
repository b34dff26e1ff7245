//! Redis pub/sub transport
//!
//! Publishing goes through a [`ConnectionManager`]. Receiving runs on a
//! dedicated thread with its own current-thread runtime: it subscribes to
//! the channel, feeds payloads to the dispatcher, PINGs periodically and
//! resubscribes at a fixed interval whenever the subscription is lost.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ::redis::Client;
use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::runtime::Builder;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{ClusterTransport, CommandDispatcher, StateCell, TransportState};
use crate::command::{Command, SourceId};
use crate::config::Properties;
use crate::registry::ProviderRegistry;
use crate::tier::redis::connection_url;
use crate::CacheError;

const DEFAULT_CHANNEL: &str = "tiercache";

/// Properties: `channel` (default `tiercache`), `channel.host` to use a
/// different server than the L2 section names, connection keys as for the
/// L2 provider, `reconnect_ms` (default 1000) and `health_check_ms`
/// (default 30000).
pub struct RedisPubSubTransport {
    client: Client,
    channel: String,
    source: SourceId,
    timeout: Duration,
    reconnect_interval: Duration,
    health_interval: Duration,
    state: Arc<StateCell>,
    publisher: Mutex<Option<ConnectionManager>>,
    shutdown: watch::Sender<bool>,
    receiver: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RedisPubSubTransport {
    pub fn from_properties(
        props: &Properties,
        source: SourceId,
        timeout: Duration,
    ) -> Result<Self, CacheError> {
        let mut conn_props = props.clone();
        if let Some(host) = props.get("channel.host") {
            conn_props.insert("hosts", host);
        }
        let client = Client::open(connection_url(&conn_props)?)?;

        Ok(Self {
            client,
            channel: props.get_or("channel", DEFAULT_CHANNEL).to_owned(),
            source,
            timeout,
            reconnect_interval: Duration::from_millis(props.parse_or("reconnect_ms", 1000u64)?),
            health_interval: Duration::from_millis(props.parse_or("health_check_ms", 30_000u64)?),
            state: Arc::new(StateCell::new()),
            publisher: Mutex::new(None),
            shutdown: watch::channel(false).0,
            receiver: Mutex::new(None),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn spawn_receiver(&self, dispatcher: CommandDispatcher) -> Result<(), CacheError> {
        self.shutdown.send_replace(false);
        let subscriber = Subscriber {
            client: self.client.clone(),
            channel: self.channel.clone(),
            dispatcher,
            state: Arc::clone(&self.state),
            shutdown: self.shutdown.subscribe(),
            timeout: self.timeout,
            reconnect_interval: self.reconnect_interval,
            health_interval: self.health_interval,
        };

        let handle = thread::Builder::new()
            .name("tiercache-subscriber".to_owned())
            .spawn(move || match Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt.block_on(subscriber.run()),
                Err(e) => error!("Failed to build subscriber runtime: {}", e),
            })
            .map_err(|e| CacheError::unavailable(format!("cannot start subscriber thread: {e}")))?;

        if let Ok(mut receiver) = self.receiver.lock() {
            *receiver = Some(handle);
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterTransport for RedisPubSubTransport {
    fn name(&self) -> &str {
        "redis"
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
        let started = Instant::now();
        self.state.set(TransportState::Connecting);

        let publisher =
            match tokio::time::timeout(self.timeout, ConnectionManager::new(self.client.clone()))
                .await
            {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    self.state.set(TransportState::Disconnected);
                    return Err(e.into());
                }
                Err(e) => {
                    self.state.set(TransportState::Disconnected);
                    return Err(e.into());
                }
            };
        if let Ok(mut slot) = self.publisher.lock() {
            *slot = Some(publisher);
        }

        if let Err(e) = self.spawn_receiver(CommandDispatcher::new(self.source, registry)) {
            self.state.set(TransportState::Disconnected);
            return Err(e);
        }

        self.publish(Command::join()).await?;
        self.state.set(TransportState::Connected);
        info!(
            "Connected to redis channel:{}, time {} ms",
            self.channel,
            started.elapsed().as_millis()
        );
        Ok(())
    }

    async fn publish(&self, cmd: Command) -> Result<(), CacheError> {
        let publisher = self.publisher.lock().ok().and_then(|p| p.clone());
        let Some(mut conn) = publisher else {
            return Err(CacheError::unavailable("redis transport is not connected"));
        };
        let payload = cmd.stamped(self.source).to_json()?;
        tokio::time::timeout(
            self.timeout,
            conn.publish::<_, _, ()>(&self.channel, payload),
        )
        .await??;
        Ok(())
    }

    async fn disconnect(&self) {
        if self.state.get() == TransportState::Disconnected {
            return;
        }
        if let Err(e) = self.publish(Command::quit()).await {
            warn!("Failed to announce quit on {}: {}", self.channel, e);
        }
        self.shutdown.send_replace(true);

        let receiver = self.receiver.lock().ok().and_then(|mut r| r.take());
        if let Some(handle) = receiver {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => {}
                _ => warn!("Subscriber thread did not stop cleanly"),
            }
        }
        if let Ok(mut slot) = self.publisher.lock() {
            slot.take();
        }
        self.state.set(TransportState::Disconnected);
        info!("Unsubscribed from redis channel:{}", self.channel);
    }
}

/// State owned by the receive thread.
struct Subscriber {
    client: Client,
    channel: String,
    dispatcher: CommandDispatcher,
    state: Arc<StateCell>,
    shutdown: watch::Receiver<bool>,
    timeout: Duration,
    reconnect_interval: Duration,
    health_interval: Duration,
}

impl Subscriber {
    async fn run(mut self) {
        while !*self.shutdown.borrow() {
            let opened = tokio::select! {
                _ = self.shutdown.changed() => break,
                opened = tokio::time::timeout(self.timeout, self.client.get_async_pubsub()) => opened,
            };
            let mut pubsub = match opened {
                Ok(Ok(pubsub)) => pubsub,
                Ok(Err(e)) => {
                    warn!("Failed to open redis pubsub connection: {}", e);
                    if self.pause().await {
                        break;
                    }
                    continue;
                }
                Err(_) => {
                    warn!("Timed out opening redis pubsub connection");
                    if self.pause().await {
                        break;
                    }
                    continue;
                }
            };

            let subscribed = tokio::select! {
                _ = self.shutdown.changed() => break,
                subscribed = tokio::time::timeout(self.timeout, pubsub.subscribe(&self.channel)) => subscribed,
            };
            match subscribed {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Failed to subscribe to {}: {}", self.channel, e);
                    if self.pause().await {
                        break;
                    }
                    continue;
                }
                Err(_) => {
                    warn!("Timed out subscribing to {}", self.channel);
                    if self.pause().await {
                        break;
                    }
                    continue;
                }
            }
            self.state.set(TransportState::Connected);
            debug!("Subscribed to channel {}", self.channel);

            let mut health = tokio::time::interval(self.health_interval);
            health.tick().await;
            {
                let mut messages = pubsub.on_message();
                loop {
                    tokio::select! {
                        _ = self.shutdown.changed() => return,
                        msg = messages.next() => match msg {
                            Some(msg) => match msg.get_payload::<String>() {
                                Ok(payload) => self.dispatcher.dispatch_payload(&payload).await,
                                Err(e) => warn!("Failed to decode pub/sub payload: {}", e),
                            },
                            None => break,
                        },
                        _ = health.tick() => {
                            if !self.ping().await {
                                break;
                            }
                        }
                    }
                }
            }

            self.state.set(TransportState::Connecting);
            warn!("Lost subscription to {}, reconnecting", self.channel);
            if self.pause().await {
                break;
            }
        }
        debug!("Subscriber for {} stopped", self.channel);
    }

    /// Wait one reconnect interval. True when shutdown was requested meanwhile.
    async fn pause(&mut self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.reconnect_interval) => *self.shutdown.borrow(),
            changed = self.shutdown.changed() => changed.is_err() || *self.shutdown.borrow(),
        }
    }

    async fn ping(&self) -> bool {
        let attempt = async {
            match self.client.get_multiplexed_async_connection().await {
                Ok(mut conn) => ::redis::cmd("PING").query_async::<String>(&mut conn).await,
                Err(e) => Err(e),
            }
        };
        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(_)) => {
                self.state.set(TransportState::Connected);
                true
            }
            Ok(Err(e)) => {
                warn!("PING failed ({}); attempting reconnection", e);
                false
            }
            Err(_) => {
                warn!("PING timed out; attempting reconnection");
                false
            }
        }
    }
}
