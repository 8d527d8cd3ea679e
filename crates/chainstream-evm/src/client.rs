//! The node-facing contract of the engine.

use async_trait::async_trait;

use chainstream_core::error::StreamError;
use chainstream_core::types::{Block, BlockNumber, TransactionReceipt};

/// Read access to an Ethereum-compatible node.
///
/// Implementations report every transport or shape problem as
/// [`StreamError::Rpc`]; the reconciler turns those into aborted ticks.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// `eth_blockNumber`.
    async fn block_number(&self) -> Result<BlockNumber, StreamError>;

    /// `eth_getBlockByNumber`; `None` when the node has no such block yet.
    async fn block_by_number(
        &self,
        number: BlockNumber,
        full_transactions: bool,
    ) -> Result<Option<Block>, StreamError>;

    /// One receipt per hash, in the order of `hashes`.
    async fn transaction_receipts(
        &self,
        hashes: &[String],
    ) -> Result<Vec<TransactionReceipt>, StreamError>;

    /// `net_version`.
    async fn net_version(&self) -> Result<String, StreamError>;

    /// `web3_clientVersion`.
    async fn client_version(&self) -> Result<String, StreamError>;
}
