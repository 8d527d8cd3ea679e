//! Block records: compressed, immutable `{block, receipts}` payloads.
//!
//! Records are keyed by `(hash, number)` and are written with a conditional
//! put: re-saving a key that already exists is a no-op reported as
//! [`PutOutcome::AlreadyExists`], never an overwrite. Reorg detection only
//! needs [`BlockStore::exists`]; the drain reads full payloads back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::codec::{decode_payload, encode_payload};
use crate::error::StreamError;
use crate::types::{BlockNumber, BlockPayload};

/// The header-only view of a stored block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMetadata {
    pub hash: String,
    pub number: BlockNumber,
    pub parent_hash: String,
}

/// A persisted block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub hash: String,
    pub number: BlockNumber,
    pub parent_hash: String,
    /// Expiry, milliseconds since epoch. Stores may drop the record after it.
    pub ttl: i64,
    /// zlib-compressed JSON of the [`BlockPayload`].
    pub payload: Vec<u8>,
}

impl BlockRecord {
    /// Compress `payload` into a record expiring at `ttl`.
    pub fn seal(payload: &BlockPayload, ttl: i64) -> Result<Self, StreamError> {
        Ok(Self {
            hash: payload.block.hash.clone(),
            number: payload.block.number,
            parent_hash: payload.block.parent_hash.clone(),
            ttl,
            payload: encode_payload(payload)?,
        })
    }

    /// Decompress the stored payload.
    pub fn open(&self) -> Result<BlockPayload, StreamError> {
        let payload = decode_payload(&self.payload)?;
        if payload.block.hash != self.hash || payload.block.number != self.number {
            return Err(StreamError::Inconsistent(format!(
                "record {}#{} holds payload of {}#{}",
                self.hash, self.number, payload.block.hash, payload.block.number
            )));
        }
        Ok(payload)
    }

    /// Split the compressed payload for stores with a per-item size limit.
    ///
    /// Concatenating the chunks in order yields `payload` again.
    pub fn chunks(&self, max_chunk_bytes: usize) -> Vec<&[u8]> {
        if self.payload.is_empty() {
            return vec![&self.payload[..]];
        }
        self.payload.chunks(max_chunk_bytes.max(1)).collect()
    }

    pub fn metadata(&self) -> BlockMetadata {
        BlockMetadata {
            hash: self.hash.clone(),
            number: self.number,
            parent_hash: self.parent_hash.clone(),
        }
    }
}

/// Result of a conditional block write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// Another writer (or an earlier attempt) already stored this key.
    AlreadyExists,
}

/// Durable storage for block records.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Whether a record with exactly this `(hash, number)` exists.
    async fn exists(&self, hash: &str, number: BlockNumber) -> Result<bool, StreamError> {
        Ok(self.metadata(hash, number).await?.is_some())
    }

    /// Header fields of a stored record.
    async fn metadata(
        &self,
        hash: &str,
        number: BlockNumber,
    ) -> Result<Option<BlockMetadata>, StreamError>;

    /// The full record including the compressed payload.
    async fn record(
        &self,
        hash: &str,
        number: BlockNumber,
    ) -> Result<Option<BlockRecord>, StreamError>;

    /// Conditional insert keyed by `(record.hash, record.number)`.
    async fn put_block(&self, record: BlockRecord) -> Result<PutOutcome, StreamError>;

    /// Metadata of every stored block at `number` (all competing forks).
    async fn blocks_at(&self, number: BlockNumber) -> Result<Vec<BlockMetadata>, StreamError>;

    /// Read and decompress the payload of a stored block.
    async fn get_block(
        &self,
        hash: &str,
        number: BlockNumber,
    ) -> Result<Option<BlockPayload>, StreamError> {
        match self.record(hash, number).await? {
            Some(record) => Ok(Some(record.open()?)),
            None => Ok(None),
        }
    }

    /// Seal `payload` and insert it.
    async fn put_payload(
        &self,
        payload: &BlockPayload,
        ttl: i64,
    ) -> Result<PutOutcome, StreamError> {
        self.put_block(BlockRecord::seal(payload, ttl)?).await
    }
}
