//! Rewind protocol: move the pointer one block back after a reorg.
//!
//! Each invocation retracts exactly the block the pointer names. A deeper
//! reorg is repaired by successive ticks, and the streak of consecutive
//! one-block retreats recorded in the pointer history is what the bound is
//! checked against.

use alloy_primitives::U256;
use tracing::{error, warn};

use chainstream_core::block::BlockStore;
use chainstream_core::config::StreamConfig;
use chainstream_core::pointer::{ChainPointer, PointerStore};
use chainstream_core::queue::{PointerMessage, QueueTransport};
use chainstream_core::state::{ReconcileState, TickOutcome};
use chainstream_core::types::unix_millis;

use crate::notify::notify_block;
use crate::retry::RetryPolicy;

/// Retract the block `pointer` names and move the pointer onto its parent.
pub async fn rewind_one_block(
    pointers: &dyn PointerStore,
    blocks: &dyn BlockStore,
    queue: &dyn QueueTransport,
    config: &StreamConfig,
    policy: &RetryPolicy,
    pointer: &ChainPointer,
) -> TickOutcome {
    let network_id = pointer.network_id;
    let streak = pointer.consecutive_rewinds();
    if streak as u64 > config.rewind_block_lookback {
        error!(
            network_id,
            streak,
            lookback = config.rewind_block_lookback,
            block_number = %pointer.block_number,
            block_hash = %pointer.block_hash,
            "rewind bound exceeded, refusing to continue"
        );
        return TickOutcome::fatal(format!(
            "{streak} consecutive rewinds exceed the lookback of {} blocks at #{} ({})",
            config.rewind_block_lookback, pointer.block_number, pointer.block_hash
        ));
    }

    let metadata = match blocks.metadata(&pointer.block_hash, pointer.block_number).await {
        Ok(Some(m)) => m,
        Ok(None) => {
            // nothing to retract from; a later fetch may still resolve the fork
            error!(
                network_id,
                block_number = %pointer.block_number,
                block_hash = %pointer.block_hash,
                "pointer block missing from the block store, cannot rewind"
            );
            return TickOutcome::aborted(
                ReconcileState::Rewinding,
                format!("block {}#{} is not stored", pointer.block_hash, pointer.block_number),
            );
        }
        Err(e) => return TickOutcome::aborted(ReconcileState::Rewinding, e.to_string()),
    };

    let Some(parent_number) = metadata.number.checked_sub(U256::from(1)) else {
        return TickOutcome::fatal(format!("reorg below genesis at {}", metadata.hash));
    };

    let next = pointer.retreat(
        metadata.parent_hash.clone(),
        parent_number,
        config.history_depth,
        unix_millis(),
    );
    if let Err(e) = pointers.put_pointer(Some(pointer), &next).await {
        if e.is_conflict() {
            warn!(network_id, "pointer moved concurrently during rewind");
        }
        return TickOutcome::aborted(ReconcileState::Rewinding, e.to_string());
    }

    let retraction = PointerMessage::retracted(pointer.block_hash.clone(), pointer.block_number);
    if let Err(e) = notify_block(queue, &config.new_block_queue, network_id, &retraction, policy).await {
        error!(
            network_id,
            block_number = %pointer.block_number,
            block_hash = %pointer.block_hash,
            error = %e,
            "pointer retreated but the retraction could not be enqueued"
        );
        return TickOutcome::aborted(ReconcileState::Notifying, e.to_string());
    }

    warn!(
        network_id,
        retracted_number = %pointer.block_number,
        retracted_hash = %pointer.block_hash,
        block_number = %parent_number,
        block_hash = %metadata.parent_hash,
        streak = streak + 1,
        sequence_index = next.sequence_index,
        "rewound one block"
    );
    TickOutcome::Rewound {
        retracted_number: pointer.block_number,
        retracted_hash: pointer.block_hash.clone(),
        block_number: parent_number,
        block_hash: metadata.parent_hash,
    }
}
