//! chainstream-evm: the reorg-aware engine for EVM chains.
//!
//! - [`reconciler`]: one reconciliation tick (fetch, validate, persist, notify, advance)
//! - [`rewind`]: the single-step rewind that repairs reorgs
//! - [`drain`]: pointer messages → decoded, content-addressed log / tx messages
//! - [`rpc`]: validated JSON-RPC [`ChainClient`] over HTTP
//! - [`engine`]: long-running loops for the reconciler and drain

pub mod builder;
pub mod client;
pub mod drain;
pub mod engine;
pub mod notify;
pub mod reconciler;
pub mod retry;
pub mod rewind;
pub mod rpc;
pub mod trigger;

pub use builder::StreamConfigBuilder;
pub use client::ChainClient;
pub use drain::{log_message_id, transaction_message_id, Drainer};
pub use engine::{check_network, run_drain_worker, run_reconcile_loop, LoopSummary};
pub use notify::{decode_pointer_message, notify_block};
pub use reconciler::Reconciler;
pub use retry::{retry, RetryConfig, RetryPolicy};
pub use rewind::rewind_one_block;
pub use rpc::{HttpChainClient, HttpClientConfig};
pub use trigger::{ChannelTrigger, DrainTrigger, RetryingTrigger};
