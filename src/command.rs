//! Cluster invalidation commands
//!
//! The logical shape is fixed: a 32-bit source id, a one-byte operator, a
//! region and a list of keys. Transports that carry text use the JSON form
//! produced by [`Command::to_json`].

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Identifies the node that published a command.
///
/// Assigned once per process; only used to drop our own broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(u32);

impl SourceId {
    /// A fresh random, non-zero id. Zero is what an unstamped command carries.
    pub fn generate() -> Self {
        loop {
            let id: u32 = rand::random();
            if id != 0 {
                return SourceId(id);
            }
        }
    }

    pub const fn from_raw(id: u32) -> Self {
        SourceId(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Operator {
    Join,
    EvictKey,
    ClearRegion,
    Quit,
}

impl From<Operator> for u8 {
    fn from(op: Operator) -> u8 {
        match op {
            Operator::Join => 0x01,
            Operator::EvictKey => 0x02,
            Operator::ClearRegion => 0x03,
            Operator::Quit => 0x04,
        }
    }
}

impl TryFrom<u8> for Operator {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x01 => Ok(Operator::Join),
            0x02 => Ok(Operator::EvictKey),
            0x03 => Ok(Operator::ClearRegion),
            0x04 => Ok(Operator::Quit),
            other => Err(format!("unknown operator code {other}")),
        }
    }
}

/// A broadcast invalidation intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "src", default = "unstamped")]
    pub source: SourceId,
    pub operator: Operator,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub keys: Vec<String>,
}

fn unstamped() -> SourceId {
    SourceId(0)
}

impl Command {
    pub fn new(operator: Operator, region: impl Into<String>, keys: Vec<String>) -> Self {
        Self {
            source: unstamped(),
            operator,
            region: region.into(),
            keys,
        }
    }

    pub fn join() -> Self {
        Self::new(Operator::Join, "", Vec::new())
    }

    pub fn quit() -> Self {
        Self::new(Operator::Quit, "", Vec::new())
    }

    pub fn evict(region: impl Into<String>, keys: Vec<String>) -> Self {
        Self::new(Operator::EvictKey, region, keys)
    }

    pub fn clear(region: impl Into<String>) -> Self {
        Self::new(Operator::ClearRegion, region, Vec::new())
    }

    pub fn stamped(mut self, source: SourceId) -> Self {
        self.source = source;
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a received payload. Malformed input is logged and dropped.
    pub fn parse(payload: &str) -> Option<Command> {
        match serde_json::from_str(payload) {
            Ok(cmd) => Some(cmd),
            Err(e) => {
                warn!("Failed to parse cluster command {}: {}", payload, e);
                None
            }
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}(src={}, region={}, keys=[{}])",
            self.operator,
            self.source,
            self.region,
            self.keys.join(",")
        )
    }
}
