//! Error types for the chainstream pipeline.

use thiserror::Error;

/// Errors that can occur while reconciling or draining blocks.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Queue error: {0}")]
    Queue(String),

    /// A conditional pointer write lost against a concurrent writer.
    #[error("Chain pointer for network {network_id} changed since it was read")]
    PointerConflict { network_id: u64 },

    #[error("Inconsistent chain data: {0}")]
    Inconsistent(String),

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl StreamError {
    /// Returns `true` if the error is a lost compare-and-swap.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::PointerConflict { .. })
    }

    /// Returns `true` if repeating the same call may succeed.
    ///
    /// A lost CAS is not: the pointer has to be read again first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Rpc(_) | Self::Storage(_) | Self::Queue(_))
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}
