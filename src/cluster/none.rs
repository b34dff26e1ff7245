//! Transport for single-node deployments.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ClusterTransport, StateCell, TransportState};
use crate::command::{Command, SourceId};
use crate::registry::ProviderRegistry;
use crate::CacheError;

/// Sends nothing and receives nothing.
pub struct NoneTransport {
    source: SourceId,
    state: StateCell,
}

impl NoneTransport {
    pub fn new(source: SourceId) -> Self {
        Self {
            source,
            state: StateCell::new(),
        }
    }
}

#[async_trait]
impl ClusterTransport for NoneTransport {
    fn name(&self) -> &str {
        "none"
    }

    fn source(&self) -> SourceId {
        self.source
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    async fn connect(&self, _registry: Arc<ProviderRegistry>) -> Result<(), CacheError> {
        self.state.set(TransportState::Connected);
        Ok(())
    }

    async fn publish(&self, _cmd: Command) -> Result<(), CacheError> {
        Ok(())
    }

    async fn disconnect(&self) {
        self.state.set(TransportState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::NullProvider;

    #[tokio::test]
    async fn test_lifecycle() {
        let registry = ProviderRegistry::from_providers(Arc::new(NullProvider), Arc::new(NullProvider));
        let transport = NoneTransport::new(SourceId::from_raw(3));
        assert_eq!(transport.state(), TransportState::Disconnected);

        transport.connect(registry).await.unwrap();
        assert_eq!(transport.state(), TransportState::Connected);
        transport.send_evict_cmd("r", vec!["k".into()]).await.unwrap();
        transport.send_clear_cmd("r").await.unwrap();

        transport.disconnect().await;
        transport.disconnect().await;
        assert_eq!(transport.state(), TransportState::Disconnected);
    }
}
