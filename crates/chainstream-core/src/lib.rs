//! chainstream-core: foundation for the reorg-aware block streaming engine.
//!
//! # Architecture
//!
//! ```text
//! Reconciler (one tick)                     Drainer (per pointer message)
//!   ├── ChainPointer / PointerStore (CAS)     ├── BlockStore (payload read)
//!   ├── BlockStore (conditional put)          ├── AbiResolver + decoder
//!   └── QueueTransport (pointer messages) ──▶ └── QueueTransport (log / tx fan-out)
//! ```
//!
//! This crate holds the shared data model and the storage / queue contracts.
//! Backends live in `chainstream-storage`, decoding in `chainstream-abi` and
//! the engine itself in `chainstream-evm`.

pub mod abi;
pub mod block;
pub mod codec;
pub mod config;
pub mod error;
pub mod pointer;
pub mod queue;
pub mod state;
pub mod types;

pub use abi::{AbiParam, AbiRecord, AbiStore, ContractAbi, ContractMember, MemberKind};
pub use block::{BlockMetadata, BlockRecord, BlockStore, PutOutcome};
pub use config::StreamConfig;
pub use error::StreamError;
pub use pointer::{next_fetch_block, ChainPointer, PointerHistoryEntry, PointerStore};
pub use queue::{
    chunk_messages, network_group_key, BatchLimits, OutgoingMessage, PointerMessage,
    QueueTransport, ReceivedMessage,
};
pub use state::{DrainReport, DrainStatus, ReconcileState, TickOutcome};
pub use types::{
    Block, BlockNumber, BlockPayload, BlockTransactions, Decoded, DecodedLog,
    DecodedTransaction, Log, Transaction, TransactionReceipt, unix_millis,
};
