//! Fluent builder for [`StreamConfig`].
//!
//! # Example
//!
//! ```rust,no_run
//! use chainstream_evm::StreamConfigBuilder;
//!
//! let config = StreamConfigBuilder::new()
//!     .network_id(1)
//!     .num_blocks_delay(2)
//!     .rewind_block_lookback(12)
//!     .history_depth(64)
//!     .queues("new-blocks", "log-firehose", "transaction-firehose")
//!     .build()
//!     .expect("valid config");
//! ```

use chainstream_core::config::StreamConfig;
use chainstream_core::error::StreamError;

#[derive(Default)]
pub struct StreamConfigBuilder {
    config: StreamConfig,
}

impl StreamConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: StreamConfig::default(),
        }
    }

    pub fn network_id(mut self, id: u64) -> Self {
        self.config.network_id = id;
        self
    }

    /// Blocks to stay behind the node's head.
    pub fn num_blocks_delay(mut self, blocks: u64) -> Self {
        self.config.num_blocks_delay = blocks;
        self
    }

    /// Start margin and the maximum rewind streak.
    pub fn rewind_block_lookback(mut self, blocks: u64) -> Self {
        self.config.rewind_block_lookback = blocks;
        self
    }

    pub fn history_depth(mut self, depth: usize) -> Self {
        self.config.history_depth = depth;
        self
    }

    pub fn block_data_ttl_ms(mut self, ms: i64) -> Self {
        self.config.block_data_ttl_ms = ms;
        self
    }

    pub fn abi_unavailable_ttl_secs(mut self, secs: i64) -> Self {
        self.config.abi_unavailable_ttl_secs = secs;
        self
    }

    /// Pointer-message queue, log output queue and transaction output queue.
    pub fn queues(
        mut self,
        new_blocks: impl Into<String>,
        logs: impl Into<String>,
        transactions: impl Into<String>,
    ) -> Self {
        self.config.new_block_queue = new_blocks.into();
        self.config.log_queue = logs.into();
        self.config.transaction_queue = transactions.into();
        self
    }

    pub fn tick_interval_ms(mut self, ms: u64) -> Self {
        self.config.tick_interval_ms = ms;
        self
    }

    pub fn min_remaining_budget_ms(mut self, ms: u64) -> Self {
        self.config.min_remaining_budget_ms = ms;
        self
    }

    pub fn drain_batch_size(mut self, size: usize) -> Self {
        self.config.drain_batch_size = size;
        self
    }

    pub fn drain_concurrency(mut self, n: usize) -> Self {
        self.config.drain_concurrency = n;
        self
    }

    pub fn max_block_chunk_bytes(mut self, bytes: usize) -> Self {
        self.config.max_block_chunk_bytes = bytes;
        self
    }

    /// The config as set, without validation.
    pub fn build_config(self) -> StreamConfig {
        self.config
    }

    pub fn build(self) -> Result<StreamConfig, StreamError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let cfg = StreamConfigBuilder::new().build().unwrap();
        assert_eq!(cfg.network_id, 1);
        assert_eq!(cfg.rewind_block_lookback, 10);
        assert_eq!(cfg.new_block_queue, "new-blocks");
    }

    #[test]
    fn builder_custom() {
        let cfg = StreamConfigBuilder::new()
            .network_id(137)
            .num_blocks_delay(3)
            .rewind_block_lookback(20)
            .history_depth(40)
            .queues("nb", "logs", "txs")
            .build()
            .unwrap();
        assert_eq!(cfg.network_id, 137);
        assert_eq!(cfg.num_blocks_delay, 3);
        assert_eq!(cfg.history_depth, 40);
        assert_eq!(cfg.transaction_queue, "txs");
    }

    #[test]
    fn build_validates() {
        let err = StreamConfigBuilder::new()
            .rewind_block_lookback(50)
            .history_depth(32)
            .build();
        assert!(err.is_err());
        // unvalidated escape hatch
        let cfg = StreamConfigBuilder::new().history_depth(0).build_config();
        assert_eq!(cfg.history_depth, 0);
    }
}
