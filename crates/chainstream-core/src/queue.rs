//! Queue transport contract and the pointer message format.
//!
//! Queues are FIFO per group key and discard a message whose dedup key was
//! already accepted (SQS FIFO semantics). The engine relies on both: pointer
//! messages share one group per network so retractions and re-additions are
//! drained in the order they were decided, and every message id is derived
//! from content so redeliveries collapse.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::types::BlockNumber;

/// Announces that a block was reconciled (`removed = false`) or retracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerMessage {
    pub hash: String,
    pub number: BlockNumber,
    pub removed: bool,
}

impl PointerMessage {
    pub fn added(hash: impl Into<String>, number: BlockNumber) -> Self {
        Self {
            hash: hash.into(),
            number,
            removed: false,
        }
    }

    pub fn retracted(hash: impl Into<String>, number: BlockNumber) -> Self {
        Self {
            hash: hash.into(),
            number,
            removed: true,
        }
    }

    /// `"{hash}-{number}-{removed}"`, number in `0x` hex.
    pub fn dedup_key(&self) -> String {
        format!("{}-{:#x}-{}", self.hash, self.number, self.removed)
    }
}

/// The FIFO group shared by every message of one network.
pub fn network_group_key(network_id: u64) -> String {
    format!("net-{network_id}")
}

// ─── Messages ─────────────────────────────────────────────────────────────────

/// A message handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Batch-entry id; unique within one batch.
    pub id: String,
    pub dedup_key: String,
    pub group_key: String,
    pub body: String,
}

impl OutgoingMessage {
    /// A message whose id doubles as its dedup key.
    pub fn content_addressed(
        id: impl Into<String>,
        group_key: impl Into<String>,
        body: String,
    ) -> Self {
        let id = id.into();
        Self {
            dedup_key: id.clone(),
            id,
            group_key: group_key.into(),
            body,
        }
    }

    pub fn size(&self) -> usize {
        self.body.len()
    }
}

/// A message delivered by [`QueueTransport::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    /// Opaque handle required to acknowledge this delivery.
    pub receipt_handle: String,
    pub body: String,
    /// How many times this message has been delivered, this one included.
    pub receive_count: u32,
}

/// Per-call limits of a batch send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_entries: usize,
    pub max_bytes: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_entries: 10,
            max_bytes: 256 * 1024,
        }
    }
}

/// Split `messages` into batches respecting `limits`, preserving order.
///
/// A single message larger than `max_bytes` still gets a batch of its own;
/// the transport decides whether to reject it.
pub fn chunk_messages(
    messages: Vec<OutgoingMessage>,
    limits: &BatchLimits,
) -> Vec<Vec<OutgoingMessage>> {
    let max_entries = limits.max_entries.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<OutgoingMessage> = Vec::new();
    let mut current_bytes = 0usize;

    for message in messages {
        let size = message.size();
        let full = current.len() >= max_entries
            || (!current.is_empty() && current_bytes + size > limits.max_bytes);
        if full {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(message);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

// ─── Transport ────────────────────────────────────────────────────────────────

#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Enqueue one message; returns the transport's message id.
    async fn send(&self, queue: &str, message: OutgoingMessage) -> Result<String, StreamError>;

    /// Enqueue a batch. Fails as a whole if any entry was rejected.
    async fn send_batch(
        &self,
        queue: &str,
        messages: Vec<OutgoingMessage>,
    ) -> Result<(), StreamError>;

    /// Receive up to `max` visible messages, oldest first.
    async fn receive(&self, queue: &str, max: usize) -> Result<Vec<ReceivedMessage>, StreamError>;

    /// Delete a received message so it is not delivered again.
    async fn ack(&self, queue: &str, message: &ReceivedMessage) -> Result<(), StreamError>;

    fn batch_limits(&self) -> BatchLimits {
        BatchLimits::default()
    }
}
