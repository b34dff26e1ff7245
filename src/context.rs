//! Per-process identity handed to every component at start-up.

use std::sync::Arc;

use crate::command::SourceId;
use crate::serializer::{JsonSerializer, Serializer};

#[derive(Clone)]
pub struct NodeContext {
    source: SourceId,
    serializer: Arc<dyn Serializer>,
}

impl NodeContext {
    pub fn new(source: SourceId, serializer: Arc<dyn Serializer>) -> Self {
        Self { source, serializer }
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }
}

impl Default for NodeContext {
    fn default() -> Self {
        Self::new(SourceId::generate(), Arc::new(JsonSerializer))
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("source", &self.source)
            .field("serializer", &self.serializer.name())
            .finish()
    }
}
