//! Replicated command format.
//!
//! Commands are the only payload that travels through the consensus log, so
//! the encoding lives here, shared by the gateway (which encodes) and the
//! state machine (which decodes), so both sides always agree. The encoding is
//! deterministic: the same command value produces identical bytes on every
//! node, which keeps log replay idempotent across the cluster.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A mutation to the replicated state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Set {
        key: String,
        value: String,
        /// TTL in nanoseconds; 0 means the item never expires.
        ttl_nanos: u64,
    },
    Delete {
        key: String,
    },
}

impl Command {
    pub fn set(key: &str, value: &str, ttl: Duration) -> Self {
        Command::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl_nanos: ttl.as_nanos() as u64,
        }
    }

    pub fn delete(key: &str) -> Self {
        Command::Delete {
            key: key.to_string(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}
