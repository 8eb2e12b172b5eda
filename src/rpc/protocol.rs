//! Binary RPC wire format.
//!
//! Length-prefixed bincode frames over TCP: `[u32 big-endian length][body]`.
//! Not-found on `Get` is an ordinary response (`found = false`), never a
//! transport-level error; the `Error` response is reserved for genuinely
//! exceptional conditions such as a failed consistency check.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcRequest {
    Get {
        key: String,
    },
    Set {
        key: String,
        value: String,
        ttl_seconds: u64,
    },
    Delete {
        key: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResponse {
    Get { value: String, found: bool },
    Set { success: bool },
    Delete { success: bool },
    Error { message: String },
}
