//! Error types for the cache node.
//!
//! A single enum covers every failure category that can cross a subsystem
//! boundary: request validation, lookups, consistency checks, consensus
//! submission, codec failures and snapshot I/O. The HTTP translator maps
//! these onto status codes; the binary RPC surface folds most of them into
//! explicit success flags instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    /// A required request parameter was missing or malformed.
    #[error("missing {0}")]
    MissingParam(&'static str),

    /// Key absent or expired. Distinct from internal errors.
    #[error("key not found")]
    NotFound,

    /// Leadership verification failed under strong consistency.
    /// Clients may retry against another node.
    #[error("consistency check failed: {0}")]
    Consistency(String),

    /// This node is not the leader. A hint: clients should redirect.
    #[error("not the cluster leader")]
    NotLeader,

    /// The consensus round did not complete within the deadline.
    /// Ambiguous: the write may still commit.
    #[error("consensus timeout")]
    Timeout,

    /// The consensus runtime has shut down.
    #[error("consensus shut down")]
    Shutdown,

    /// Command encode/decode failure. A malformed command is a programmer
    /// error, not a data error; apply logs it and continues.
    #[error("codec error: {0}")]
    Codec(String),

    /// Snapshot sink or journal I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else that should surface as a server-side failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<bincode::Error> for CacheError {
    fn from(e: bincode::Error) -> Self {
        CacheError::Codec(e.to_string())
    }
}

impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::MissingParam(_) => StatusCode::BAD_REQUEST,
            CacheError::NotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;
