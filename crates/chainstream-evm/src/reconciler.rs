//! The reconciliation tick.
//!
//! ```text
//! Idle ─▶ Fetching ─▶ Validating ─┬─▶ Persisting ─▶ Notifying ─▶ Advancing ─▶ Idle
//!                                 └─▶ Rewinding (see rewind.rs)
//! ```
//!
//! Every stage can end the tick as `Aborted` with the pointer untouched by
//! that stage; the next tick simply tries again. Block writes are idempotent
//! and notifications carry content-derived dedup keys, so an abort after
//! persisting or notifying is safe to repeat.

use std::sync::Arc;

use alloy_primitives::U256;
use tracing::{debug, error, info, warn};

use chainstream_core::block::{BlockStore, PutOutcome};
use chainstream_core::config::StreamConfig;
use chainstream_core::error::StreamError;
use chainstream_core::pointer::{next_fetch_block, ChainPointer, PointerStore};
use chainstream_core::queue::{PointerMessage, QueueTransport};
use chainstream_core::state::{ReconcileState, TickOutcome};
use chainstream_core::types::{unix_millis, Block, BlockNumber, BlockPayload, TransactionReceipt};

use crate::client::ChainClient;
use crate::notify::notify_block;
use crate::retry::RetryPolicy;
use crate::rewind::rewind_one_block;
use crate::trigger::DrainTrigger;

/// Lag (in blocks) past which a warning is logged, largest first.
const LAG_THRESHOLDS: [u64; 4] = [10_000, 1_000, 100, 10];

/// Drives one network's chain pointer forward, one block per tick.
pub struct Reconciler {
    config: StreamConfig,
    client: Arc<dyn ChainClient>,
    pointers: Arc<dyn PointerStore>,
    blocks: Arc<dyn BlockStore>,
    queue: Arc<dyn QueueTransport>,
    trigger: Option<Arc<dyn DrainTrigger>>,
    retry: RetryPolicy,
}

impl Reconciler {
    pub fn new(
        config: StreamConfig,
        client: Arc<dyn ChainClient>,
        pointers: Arc<dyn PointerStore>,
        blocks: Arc<dyn BlockStore>,
        queue: Arc<dyn QueueTransport>,
    ) -> Self {
        Self {
            config,
            client,
            pointers,
            blocks,
            queue,
            trigger: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Wake the drain after every advance or rewind.
    pub fn with_trigger(mut self, trigger: Arc<dyn DrainTrigger>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Backoff for pointer-message sends.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<dyn ChainClient> {
        &self.client
    }

    /// The current pointer of the configured network.
    pub async fn pointer(&self) -> Result<Option<ChainPointer>, StreamError> {
        self.pointers.get_pointer(self.config.network_id).await
    }

    /// Run one tick. Never fails: every condition is a [`TickOutcome`].
    pub async fn tick(&self) -> TickOutcome {
        let outcome = self.run_tick().await;
        let network_id = self.config.network_id;
        match &outcome {
            TickOutcome::Advanced { .. } => info!(network_id, %outcome, "tick"),
            TickOutcome::Rewound { .. } => warn!(network_id, %outcome, "tick"),
            TickOutcome::UpToDate { .. } => debug!(network_id, %outcome, "tick"),
            TickOutcome::Aborted { .. } => warn!(network_id, %outcome, "tick"),
            TickOutcome::Fatal { .. } => error!(network_id, %outcome, "tick"),
        }
        if outcome.made_progress() {
            self.wake_drain().await;
        }
        outcome
    }

    async fn run_tick(&self) -> TickOutcome {
        let network_id = self.config.network_id;

        let pointer = match self.pointers.get_pointer(network_id).await {
            Ok(p) => p,
            Err(e) => return TickOutcome::aborted(ReconcileState::Idle, e.to_string()),
        };

        // ─── Fetching ───
        let head = match self.client.block_number().await {
            Ok(h) => h,
            Err(e) => return TickOutcome::aborted(ReconcileState::Fetching, e.to_string()),
        };
        let current_head = head.saturating_sub(U256::from(self.config.num_blocks_delay));
        let next_fetch = next_fetch_block(
            pointer.as_ref(),
            current_head,
            self.config.rewind_block_lookback,
        );
        if current_head < next_fetch {
            return TickOutcome::UpToDate {
                current_head,
                next_fetch,
            };
        }
        self.report_lag(current_head, next_fetch);

        let block = match self.client.block_by_number(next_fetch, true).await {
            Ok(Some(b)) => b,
            Ok(None) => {
                return TickOutcome::aborted(
                    ReconcileState::Fetching,
                    format!("node has no block #{next_fetch} yet"),
                )
            }
            Err(e) => return TickOutcome::aborted(ReconcileState::Fetching, e.to_string()),
        };
        let receipts = match self
            .client
            .transaction_receipts(&block.transactions.hashes())
            .await
        {
            Ok(r) => r,
            Err(e) => return TickOutcome::aborted(ReconcileState::Fetching, e.to_string()),
        };

        // ─── Validating ───
        if let Err(e) = validate_fetch(next_fetch, &block, &receipts) {
            error!(
                network_id,
                block_number = %block.number,
                block_hash = %block.hash,
                error = %e,
                "fetched block failed validation"
            );
            return TickOutcome::aborted(ReconcileState::Validating, e.to_string());
        }

        if let Some(p) = &pointer {
            match self.continues_pointer(p, &block).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        network_id,
                        block_number = %block.number,
                        parent_hash = %block.parent_hash,
                        pointer_hash = %p.block_hash,
                        "parent not reconciled, reorg detected"
                    );
                    return rewind_one_block(
                        self.pointers.as_ref(),
                        self.blocks.as_ref(),
                        self.queue.as_ref(),
                        &self.config,
                        &self.retry,
                        p,
                    )
                    .await;
                }
                Err(e) => return TickOutcome::aborted(ReconcileState::Validating, e.to_string()),
            }
        }

        // ─── Persisting ───
        let hash = block.hash.clone();
        let number = block.number;
        let payload = BlockPayload { block, receipts };
        let ttl = unix_millis().saturating_add(self.config.block_data_ttl_ms);
        match self.blocks.put_payload(&payload, ttl).await {
            Ok(PutOutcome::Inserted) => debug!(network_id, block_number = %number, "block stored"),
            Ok(PutOutcome::AlreadyExists) => {
                debug!(network_id, block_number = %number, "block already stored")
            }
            Err(e) => return TickOutcome::aborted(ReconcileState::Persisting, e.to_string()),
        }

        // ─── Notifying ───
        let message = PointerMessage::added(hash.clone(), number);
        if let Err(e) = notify_block(
            self.queue.as_ref(),
            &self.config.new_block_queue,
            network_id,
            &message,
            &self.retry,
        )
        .await
        {
            return TickOutcome::aborted(ReconcileState::Notifying, e.to_string());
        }

        // ─── Advancing ───
        let now = unix_millis();
        let next = match &pointer {
            None => ChainPointer::first(network_id, hash.clone(), number, now),
            Some(p) => p.advance(hash.clone(), number, self.config.history_depth, now),
        };
        if let Err(e) = self.pointers.put_pointer(pointer.as_ref(), &next).await {
            if e.is_conflict() {
                warn!(network_id, block_number = %number, "pointer advanced by another writer");
            }
            return TickOutcome::aborted(ReconcileState::Advancing, e.to_string());
        }
        debug!(network_id, sequence_index = next.sequence_index, "pointer advanced");

        TickOutcome::Advanced {
            block_number: number,
            block_hash: hash,
        }
    }

    /// Whether `block` extends the block the pointer names, and that block is stored.
    async fn continues_pointer(
        &self,
        pointer: &ChainPointer,
        block: &Block,
    ) -> Result<bool, StreamError> {
        if !block.parent_hash.eq_ignore_ascii_case(&pointer.block_hash) {
            return Ok(false);
        }
        let Some(parent_number) = block.number.checked_sub(U256::from(1)) else {
            return Ok(false);
        };
        self.blocks.exists(&pointer.block_hash, parent_number).await
    }

    fn report_lag(&self, current_head: BlockNumber, next_fetch: BlockNumber) {
        let behind = current_head - next_fetch;
        if let Some(threshold) = LAG_THRESHOLDS
            .iter()
            .find(|t| behind > U256::from(**t))
        {
            warn!(
                network_id = self.config.network_id,
                behind = %behind,
                threshold,
                "reconciler is falling behind the head"
            );
        }
    }

    async fn wake_drain(&self) {
        if let Some(trigger) = &self.trigger {
            if let Err(e) = trigger.trigger().await {
                warn!(network_id = self.config.network_id, error = %e, "failed to trigger drain");
            }
        }
    }
}

/// Consistency checks on a freshly fetched block and its receipts.
pub fn validate_fetch(
    expected_number: BlockNumber,
    block: &Block,
    receipts: &[TransactionReceipt],
) -> Result<(), StreamError> {
    if block.number != expected_number {
        return Err(StreamError::Inconsistent(format!(
            "asked for block #{expected_number}, node returned #{}",
            block.number
        )));
    }
    if receipts.len() != block.transactions.len() {
        return Err(StreamError::Inconsistent(format!(
            "block {} has {} transactions but {} receipts",
            block.hash,
            block.transactions.len(),
            receipts.len()
        )));
    }
    for log in receipts.iter().flat_map(|r| r.logs.iter()) {
        if !log.block_hash.eq_ignore_ascii_case(&block.hash) {
            return Err(StreamError::Inconsistent(format!(
                "log {} of tx {} belongs to block {}, not {}",
                log.log_index, log.transaction_hash, log.block_hash, block.hash
            )));
        }
        if log.removed {
            return Err(StreamError::Inconsistent(format!(
                "log {} of tx {} is already marked removed",
                log.log_index, log.transaction_hash
            )));
        }
    }
    Ok(())
}
