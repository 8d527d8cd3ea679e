//! In-memory storage backend.
//!
//! Holds chain pointers, block records and ABIs in RAM. Conditional writes
//! are checked under the same lock as the write, so the compare-and-swap
//! semantics match the durable backends.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use alloy_primitives::U256;
use async_trait::async_trait;
use tracing::debug;

use chainstream_core::abi::{AbiRecord, AbiStore};
use chainstream_core::block::{BlockMetadata, BlockRecord, BlockStore, PutOutcome};
use chainstream_core::error::StreamError;
use chainstream_core::pointer::{ChainPointer, PointerStore};

/// In-memory stream storage.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStorage {
    pointers: Mutex<HashMap<u64, ChainPointer>>,
    /// Keyed by `(number, hash)` so a height's forks sit next to each other.
    blocks: Mutex<BTreeMap<(U256, String), BlockRecord>>,
    abis: Mutex<HashMap<String, AbiRecord>>,
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, StreamError> {
    m.lock()
        .map_err(|_| StreamError::Storage("in-memory store lock poisoned".into()))
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored block records.
    pub fn block_count(&self) -> usize {
        self.blocks.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Drop every block record whose TTL is at or before `now`.
    pub fn purge_expired(&self, now: i64) -> Result<usize, StreamError> {
        let mut blocks = lock(&self.blocks)?;
        let before = blocks.len();
        blocks.retain(|_, r| r.ttl > now);
        Ok(before - blocks.len())
    }
}

#[async_trait]
impl PointerStore for InMemoryStorage {
    async fn get_pointer(&self, network_id: u64) -> Result<Option<ChainPointer>, StreamError> {
        Ok(lock(&self.pointers)?.get(&network_id).cloned())
    }

    async fn put_pointer(
        &self,
        previous: Option<&ChainPointer>,
        next: &ChainPointer,
    ) -> Result<(), StreamError> {
        let mut pointers = lock(&self.pointers)?;
        let stored = pointers.get(&next.network_id);
        let matches = match (previous, stored) {
            (None, None) => true,
            (Some(prev), Some(cur)) => cur.same_position(prev),
            _ => false,
        };
        if !matches {
            return Err(StreamError::PointerConflict {
                network_id: next.network_id,
            });
        }
        pointers.insert(next.network_id, next.clone());
        debug!(
            network_id = next.network_id,
            block_number = %next.block_number,
            sequence_index = next.sequence_index,
            "pointer written"
        );
        Ok(())
    }

    async fn delete_pointer(&self, network_id: u64) -> Result<(), StreamError> {
        lock(&self.pointers)?.remove(&network_id);
        Ok(())
    }
}

#[async_trait]
impl BlockStore for InMemoryStorage {
    async fn metadata(
        &self,
        hash: &str,
        number: U256,
    ) -> Result<Option<BlockMetadata>, StreamError> {
        Ok(lock(&self.blocks)?
            .get(&(number, hash.to_string()))
            .map(BlockRecord::metadata))
    }

    async fn record(&self, hash: &str, number: U256) -> Result<Option<BlockRecord>, StreamError> {
        Ok(lock(&self.blocks)?.get(&(number, hash.to_string())).cloned())
    }

    async fn put_block(&self, record: BlockRecord) -> Result<PutOutcome, StreamError> {
        let mut blocks = lock(&self.blocks)?;
        let key = (record.number, record.hash.clone());
        if blocks.contains_key(&key) {
            return Ok(PutOutcome::AlreadyExists);
        }
        blocks.insert(key, record);
        Ok(PutOutcome::Inserted)
    }

    async fn blocks_at(&self, number: U256) -> Result<Vec<BlockMetadata>, StreamError> {
        Ok(lock(&self.blocks)?
            .iter()
            .filter(|((n, _), _)| *n == number)
            .map(|(_, r)| r.metadata())
            .collect())
    }
}

#[async_trait]
impl AbiStore for InMemoryStorage {
    async fn get_abi(&self, address: &str) -> Result<Option<AbiRecord>, StreamError> {
        Ok(lock(&self.abis)?.get(&address.to_lowercase()).cloned())
    }

    async fn put_abi(&self, record: AbiRecord) -> Result<(), StreamError> {
        if let Some(abi) = &record.abi {
            abi.validate()?;
        }
        lock(&self.abis)?.insert(record.address.to_lowercase(), record);
        Ok(())
    }
}
