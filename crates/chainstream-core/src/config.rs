//! Stream configuration.

use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// Configuration for one network's stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Network whose pointer is reconciled. Must match the node's `net_version`.
    pub network_id: u64,
    /// Blocks to stay behind the node's head. Trades latency for fewer reorgs.
    pub num_blocks_delay: u64,
    /// Start margin behind the head on the first run, and the maximum length
    /// of a rewind streak before the engine stops.
    pub rewind_block_lookback: u64,
    /// Maximum number of previous positions kept in the pointer history.
    pub history_depth: usize,
    /// How long stored blocks are kept (milliseconds).
    pub block_data_ttl_ms: i64,
    /// How long a "no ABI" answer from the registry is trusted (seconds).
    pub abi_unavailable_ttl_secs: i64,
    /// Queue receiving pointer messages.
    pub new_block_queue: String,
    /// Queue receiving decoded logs.
    pub log_queue: String,
    /// Queue receiving decoded transactions.
    pub transaction_queue: String,
    /// Reconcile cadence (milliseconds).
    pub tick_interval_ms: u64,
    /// Stop issuing ticks / draining once less than this budget remains.
    pub min_remaining_budget_ms: u64,
    /// Pointer messages received per queue poll.
    pub drain_batch_size: usize,
    /// Pointer messages prepared (read + decode) concurrently.
    pub drain_concurrency: usize,
    /// Per-item chunk size for stores with an item size limit.
    pub max_block_chunk_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            network_id: 1,
            num_blocks_delay: 0,
            rewind_block_lookback: 10,
            history_depth: 32,
            block_data_ttl_ms: 7 * 24 * 60 * 60 * 1000,
            abi_unavailable_ttl_secs: 86_400,
            new_block_queue: "new-blocks".into(),
            log_queue: "log-firehose".into(),
            transaction_queue: "transaction-firehose".into(),
            tick_interval_ms: 1_000,
            min_remaining_budget_ms: 3_000,
            drain_batch_size: 10,
            drain_concurrency: 4,
            max_block_chunk_bytes: 350 * 1024,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<(), StreamError> {
        let fail = |msg: &str| Err(StreamError::Config(msg.to_string()));

        if self.history_depth == 0 {
            return fail("history_depth must be at least 1");
        }
        if (self.history_depth as u64) <= self.rewind_block_lookback {
            return fail("history_depth must exceed rewind_block_lookback or the rewind bound is never reached");
        }
        if self.drain_batch_size == 0 {
            return fail("drain_batch_size must be at least 1");
        }
        if self.drain_concurrency == 0 {
            return fail("drain_concurrency must be at least 1");
        }
        if self.max_block_chunk_bytes == 0 {
            return fail("max_block_chunk_bytes must be at least 1");
        }
        if self.block_data_ttl_ms <= 0 || self.abi_unavailable_ttl_secs <= 0 {
            return fail("TTLs must be positive");
        }

        let queues = [&self.new_block_queue, &self.log_queue, &self.transaction_queue];
        if queues.iter().any(|q| q.trim().is_empty()) {
            return fail("queue names must not be empty");
        }
        if queues[0] == queues[1] || queues[0] == queues[2] || queues[1] == queues[2] {
            return fail("queue names must be distinct");
        }
        Ok(())
    }

    pub fn abi_unavailable_ttl_ms(&self) -> i64 {
        self.abi_unavailable_ttl_secs.saturating_mul(1_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        StreamConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_shared_queue_names() {
        let cfg = StreamConfig {
            log_queue: "new-blocks".into(),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(StreamError::Config(_))));
    }

    #[test]
    fn rejects_history_shorter_than_lookback() {
        let cfg = StreamConfig {
            history_depth: 10,
            rewind_block_lookback: 10,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: StreamConfig = serde_json::from_str(r#"{"network_id": 3, "num_blocks_delay": 2}"#).unwrap();
        assert_eq!(cfg.network_id, 3);
        assert_eq!(cfg.num_blocks_delay, 2);
        assert_eq!(cfg.history_depth, 32);
        assert_eq!(cfg.new_block_queue, "new-blocks");
    }
}
