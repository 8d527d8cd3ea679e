//! Decoder and registry errors.
//!
//! Neither type escapes the drain: decoding failures pass the raw item
//! through, and registry failures resolve to "no ABI for now".

use thiserror::Error;

/// Why a log or transaction could not be decoded.
#[derive(Debug, Error)]
pub enum AbiError {
    #[error("log has no topics")]
    NoTopics,

    #[error("no event in the ABI matches topic {topic}")]
    NoMatchingEvent { topic: String },

    #[error("no function in the ABI matches selector {selector}")]
    NoMatchingFunction { selector: String },

    #[error("transaction is not a contract call")]
    NotACall,

    #[error("event {event} expects {expected} topics, log has {actual}")]
    TopicCountMismatch {
        event: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("unsupported type {ty}: {reason}")]
    UnsupportedType { ty: String, reason: String },

    #[error("ABI decode failed: {0}")]
    Decode(String),
}

/// Failures talking to an ABI registry.
///
/// None of these is a definitive "no ABI" answer; that is
/// [`RegistryLookup::NotAvailable`](crate::registry::RegistryLookup::NotAvailable).
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registry answered with HTTP status {0}")]
    Status(u16),

    #[error("malformed registry response: {0}")]
    Malformed(String),

    #[error("registry returned an invalid ABI: {0}")]
    InvalidAbi(String),

    #[error("rate limited by the registry")]
    RateLimited,
}
