//! Cache error types

use redis::RedisError;

use crate::entry::Level;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A store or transport could not be reached (network down, timeout, ...).
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(Box<dyn std::error::Error + Send + Sync>),

    /// The backend cannot perform the requested capability.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// A provider was configured into a level it does not serve.
    #[error("Provider '{provider}' is not a level {level} cache provider")]
    ProviderLevelMismatch { provider: String, level: Level },

    #[error("Unknown cache provider: {0}")]
    UnknownProvider(String),

    #[error("Unknown cluster transport: {0}")]
    UnknownTransport(String),

    /// Stored bytes do not match the expected shape.
    #[error("Deserialization error: {0}")]
    Deserialize(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A [`DataLoader`](crate::DataLoader) failed.
    #[error("Loader error: {0}")]
    Loader(Box<dyn std::error::Error + Send + Sync>),

    #[error("Cache channel is closed")]
    ChannelClosed,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CacheError {
    pub(crate) fn unavailable(msg: impl Into<String>) -> Self {
        CacheError::BackendUnavailable(msg.into().into())
    }

    /// True for transient backend failures.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CacheError::BackendUnavailable(_))
    }
}

impl From<RedisError> for CacheError {
    fn from(err: RedisError) -> Self {
        CacheError::BackendUnavailable(Box::new(err))
    }
}

impl From<tokio::time::error::Elapsed> for CacheError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        CacheError::BackendUnavailable(Box::new(err))
    }
}
