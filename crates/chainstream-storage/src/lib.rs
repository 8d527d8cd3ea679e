//! chainstream-storage: pluggable backends for ChainStream.
//!
//! Backends:
//! - [`memory`]: pointer, block and ABI stores in RAM (dev/testing, no persistence)
//! - [`queue`]: an in-process FIFO queue with dedup and visibility timeouts
//! - [`sqlite`]: SQLite via `sqlx` (embedded, single-file persistence)

pub mod memory;
pub mod queue;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryStorage;
pub use queue::InMemoryQueue;
