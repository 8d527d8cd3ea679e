//! Chain pointer, the single "last reconciled block" record per network.
//!
//! Every write goes through [`PointerStore::put_pointer`], a compare-and-swap against
//! the value the caller read at the start of its tick. The pointer carries a
//! bounded history of its previous positions, newest first, which is what the
//! rewind bound is measured against.

use alloy_primitives::U256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::types::BlockNumber;

/// A previous position of the pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerHistoryEntry {
    pub block_hash: String,
    pub block_number: BlockNumber,
    /// Record time, milliseconds since epoch.
    pub timestamp: i64,
    pub sequence_index: u64,
}

/// The persisted cursor for one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainPointer {
    pub network_id: u64,
    pub block_hash: String,
    pub block_number: BlockNumber,
    /// Record time, milliseconds since epoch.
    pub timestamp: i64,
    /// Increases by exactly one on every successful write.
    pub sequence_index: u64,
    /// Prior positions, newest first, at most `history_depth` long.
    #[serde(default)]
    pub history: Vec<PointerHistoryEntry>,
}

impl ChainPointer {
    /// The pointer written by the first ever successful tick.
    pub fn first(
        network_id: u64,
        block_hash: impl Into<String>,
        block_number: BlockNumber,
        now: i64,
    ) -> Self {
        Self {
            network_id,
            block_hash: block_hash.into(),
            block_number,
            timestamp: now,
            sequence_index: 0,
            history: Vec::new(),
        }
    }

    /// Pointer moved forward onto a newly reconciled block.
    pub fn advance(
        &self,
        block_hash: impl Into<String>,
        block_number: BlockNumber,
        history_depth: usize,
        now: i64,
    ) -> Self {
        self.successor(block_hash.into(), block_number, history_depth, now)
    }

    /// Pointer moved back onto the parent of the block it currently names.
    ///
    /// The retreat is recorded in `history` exactly like an advance, which is
    /// what lets [`consecutive_rewinds`](Self::consecutive_rewinds) see it.
    pub fn retreat(
        &self,
        parent_hash: impl Into<String>,
        parent_number: BlockNumber,
        history_depth: usize,
        now: i64,
    ) -> Self {
        self.successor(parent_hash.into(), parent_number, history_depth, now)
    }

    fn successor(
        &self,
        block_hash: String,
        block_number: BlockNumber,
        history_depth: usize,
        now: i64,
    ) -> Self {
        let mut history = Vec::with_capacity(history_depth.min(self.history.len() + 1));
        history.push(self.as_history_entry());
        history.extend(self.history.iter().cloned());
        history.truncate(history_depth);

        Self {
            network_id: self.network_id,
            block_hash,
            block_number,
            timestamp: now,
            sequence_index: self.sequence_index + 1,
            history,
        }
    }

    pub fn as_history_entry(&self) -> PointerHistoryEntry {
        PointerHistoryEntry {
            block_hash: self.block_hash.clone(),
            block_number: self.block_number,
            timestamp: self.timestamp,
            sequence_index: self.sequence_index,
        }
    }

    /// Length of the current rewind streak.
    ///
    /// Walks from the current position into `history` and counts how many
    /// consecutive steps each moved the pointer down by exactly one block.
    /// Stops at the first step that moved forward (or jumped).
    pub fn consecutive_rewinds(&self) -> usize {
        let mut current = self.block_number;
        let mut rewinds = 0;
        for entry in &self.history {
            if current.checked_add(U256::from(1)) != Some(entry.block_number) {
                break;
            }
            current = entry.block_number;
            rewinds += 1;
        }
        rewinds
    }

    /// The fields a conditional write compares against.
    pub fn same_position(&self, other: &ChainPointer) -> bool {
        self.network_id == other.network_id
            && self.block_hash == other.block_hash
            && self.block_number == other.block_number
            && self.sequence_index == other.sequence_index
    }
}

/// The block number the next tick should fetch.
///
/// Without a pointer the engine starts `lookback` blocks behind the head so
/// that a reorg in the very first blocks can still be repaired.
pub fn next_fetch_block(
    pointer: Option<&ChainPointer>,
    current_head: BlockNumber,
    lookback: u64,
) -> BlockNumber {
    match pointer {
        None => current_head.saturating_sub(U256::from(lookback)),
        Some(p) => p.block_number.saturating_add(U256::from(1)),
    }
}

// ─── Store ────────────────────────────────────────────────────────────────────

/// Durable storage for chain pointers.
///
/// Implementations: `InMemoryStorage` and `SqliteStorage` in
/// `chainstream-storage`.
#[async_trait]
pub trait PointerStore: Send + Sync {
    /// Load the pointer for `network_id` (`None` before the first tick).
    async fn get_pointer(&self, network_id: u64) -> Result<Option<ChainPointer>, StreamError>;

    /// Conditionally write `next`.
    ///
    /// With `previous = None` the write fails if any pointer exists; otherwise
    /// it fails unless the stored pointer is still at
    /// [`same_position`](ChainPointer::same_position) as `previous`. Both
    /// failures are reported as [`StreamError::PointerConflict`].
    async fn put_pointer(
        &self,
        previous: Option<&ChainPointer>,
        next: &ChainPointer,
    ) -> Result<(), StreamError>;

    /// Remove the pointer (operator reset). The next tick starts afresh.
    async fn delete_pointer(&self, network_id: u64) -> Result<(), StreamError>;
}
