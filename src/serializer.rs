//! Value serialization for the shared level
//!
//! L2 stores bytes; only the serializer can turn them back into values.

use std::sync::Arc;

use crate::CacheError;

pub trait Serializer: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>, CacheError>;

    /// Fails with [`CacheError::Deserialize`] when the bytes do not decode.
    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value, CacheError>;
}

/// JSON on the wire
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>, CacheError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value, CacheError> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Deserialize(e.to_string()))
    }
}

/// Resolve a configured serializer name.
pub fn serializer_for(name: &str) -> Result<Arc<dyn Serializer>, CacheError> {
    match name.trim().to_ascii_lowercase().as_str() {
        "" | "json" => Ok(Arc::new(JsonSerializer)),
        other => Err(CacheError::Config(format!("unknown serialization '{other}'"))),
    }
}
