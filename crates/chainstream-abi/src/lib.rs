//! chainstream-abi: contract ABI lookup and decoding.
//!
//! - [`signature`]: canonical signatures, event topics and function selectors
//! - [`decoder`]: fail-open log / transaction decoding via `alloy-core`'s dynamic ABI
//! - [`registry`]: Etherscan-compatible ABI registry client
//! - [`resolver`]: memory → durable store → registry lookup with single-flight
//!   requests and negative caching

pub mod decoder;
pub mod error;
pub mod registry;
pub mod resolver;
pub mod signature;

pub use decoder::{decode_log, decode_transaction, try_decode_log, try_decode_transaction};
pub use error::{AbiError, RegistryError};
pub use registry::{parse_registry_response, AbiRegistry, EtherscanRegistry, RegistryLookup};
pub use resolver::AbiResolver;
pub use signature::{canonical_type, event_signature, event_topic, function_selector};
