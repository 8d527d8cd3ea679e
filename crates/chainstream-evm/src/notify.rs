//! Pointer messages on the new-block queue.
//!
//! One FIFO group per network keeps retractions and re-additions in the
//! order the reconciler decided them. The dedup key is derived from the
//! message, so a tick that re-sends after a failed advance is absorbed.

use tracing::debug;

use chainstream_core::error::StreamError;
use chainstream_core::queue::{network_group_key, OutgoingMessage, PointerMessage, QueueTransport};

use crate::retry::{retry, RetryPolicy};

/// Enqueue `message` on `queue_name`; returns the transport's message id.
pub async fn notify_block(
    queue: &dyn QueueTransport,
    queue_name: &str,
    network_id: u64,
    message: &PointerMessage,
    policy: &RetryPolicy,
) -> Result<String, StreamError> {
    let outgoing = OutgoingMessage::content_addressed(
        message.dedup_key(),
        network_group_key(network_id),
        serde_json::to_string(message)?,
    );
    let id = retry(policy, "notify", || queue.send(queue_name, outgoing.clone())).await?;
    debug!(
        network_id,
        queue = queue_name,
        block_hash = %message.hash,
        block_number = %message.number,
        removed = message.removed,
        message_id = %id,
        "pointer message sent"
    );
    Ok(id)
}

/// Parse the body of a pointer message.
pub fn decode_pointer_message(body: &str) -> Result<PointerMessage, StreamError> {
    serde_json::from_str(body).map_err(|e| StreamError::Codec(format!("bad pointer message: {e}")))
}
