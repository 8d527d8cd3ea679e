//! SQLite storage backend for ChainStream.
//!
//! Persists chain pointers, block records and ABIs to a single SQLite file.
//! Block payloads are split into `block_chunks` rows no larger than the
//! configured chunk size, the way stores with per-item limits require.
//!
//! # Usage
//! ```rust,no_run
//! use chainstream_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./stream.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use alloy_primitives::U256;
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;

use chainstream_core::abi::{AbiRecord, AbiStore, ContractAbi};
use chainstream_core::block::{BlockMetadata, BlockRecord, BlockStore, PutOutcome};
use chainstream_core::error::StreamError;
use chainstream_core::pointer::{ChainPointer, PointerHistoryEntry, PointerStore};

const DEFAULT_CHUNK_BYTES: usize = 350 * 1024;

fn db_err(e: sqlx::Error) -> StreamError {
    StreamError::Storage(e.to_string())
}

fn number_key(n: U256) -> String {
    format!("{n:#x}")
}

fn parse_number(s: &str) -> Result<U256, StreamError> {
    s.parse::<U256>()
        .map_err(|e| StreamError::Storage(format!("bad stored block number {s}: {e}")))
}

/// SQLite-backed storage for pointers, blocks and ABIs.
pub struct SqliteStorage {
    pool: SqlitePool,
    chunk_bytes: usize,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./stream.db"`) or a full
    /// SQLite URL (`"sqlite:./stream.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, StreamError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(db_err)?;
        let storage = Self {
            pool,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
        };
        storage.init_schema(true).await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every connection to `:memory:` is its own database, so the pool is
    /// pinned to a single connection.
    pub async fn in_memory() -> Result<Self, StreamError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;
        let storage = Self {
            pool,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
        };
        storage.init_schema(false).await?;
        Ok(storage)
    }

    /// Set the maximum size of one payload chunk row.
    pub fn with_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes.max(1);
        self
    }

    /// Number of payload chunk rows stored for a block.
    pub async fn chunk_count(&self, hash: &str, number: U256) -> Result<usize, StreamError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM block_chunks WHERE hash = ? AND number = ?")
                .bind(hash)
                .bind(number_key(number))
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(count as usize)
    }

    async fn init_schema(&self, wal: bool) -> Result<(), StreamError> {
        if wal {
            // WAL mode: readers don't block the single writer
            sqlx::query("PRAGMA journal_mode=WAL;")
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }

        let statements = [
            "CREATE TABLE IF NOT EXISTS pointers (
                network_id     INTEGER PRIMARY KEY,
                block_hash     TEXT    NOT NULL,
                block_number   TEXT    NOT NULL,
                sequence_index INTEGER NOT NULL,
                timestamp      INTEGER NOT NULL,
                history_json   TEXT    NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS blocks (
                hash         TEXT    NOT NULL,
                number       TEXT    NOT NULL,
                parent_hash  TEXT    NOT NULL,
                ttl          INTEGER NOT NULL,
                chunk_count  INTEGER NOT NULL,
                PRIMARY KEY (hash, number)
            );",
            "CREATE INDEX IF NOT EXISTS idx_blocks_number ON blocks (number);",
            "CREATE TABLE IF NOT EXISTS block_chunks (
                hash   TEXT    NOT NULL,
                number TEXT    NOT NULL,
                idx    INTEGER NOT NULL,
                data   BLOB    NOT NULL,
                PRIMARY KEY (hash, number, idx)
            );",
            "CREATE TABLE IF NOT EXISTS abis (
                address    TEXT PRIMARY KEY,
                abi_json   TEXT,
                expires_at INTEGER
            );",
        ];
        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await.map_err(db_err)?;
        }
        Ok(())
    }

    /// Delete block records (and their chunks) whose TTL is at or before `now`.
    pub async fn purge_expired(&self, now: i64) -> Result<u64, StreamError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            "DELETE FROM block_chunks WHERE (hash, number) IN
                (SELECT hash, number FROM blocks WHERE ttl <= ?)",
        )
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        let removed = sqlx::query("DELETE FROM blocks WHERE ttl <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();
        tx.commit().await.map_err(db_err)?;
        Ok(removed)
    }

    fn row_to_metadata(row: &SqliteRow) -> Result<BlockMetadata, StreamError> {
        let number: String = row.get("number");
        Ok(BlockMetadata {
            hash: row.get("hash"),
            number: parse_number(&number)?,
            parent_hash: row.get("parent_hash"),
        })
    }
}

// ─── Pointers ─────────────────────────────────────────────────────────────────

#[async_trait]
impl PointerStore for SqliteStorage {
    async fn get_pointer(&self, network_id: u64) -> Result<Option<ChainPointer>, StreamError> {
        let row = sqlx::query(
            "SELECT block_hash, block_number, sequence_index, timestamp, history_json
             FROM pointers WHERE network_id = ?",
        )
        .bind(network_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let number: String = row.get("block_number");
        let history_json: String = row.get("history_json");
        let history: Vec<PointerHistoryEntry> = serde_json::from_str(&history_json)
            .map_err(|e| StreamError::Storage(format!("bad pointer history: {e}")))?;

        Ok(Some(ChainPointer {
            network_id,
            block_hash: row.get("block_hash"),
            block_number: parse_number(&number)?,
            timestamp: row.get("timestamp"),
            sequence_index: row.get::<i64, _>("sequence_index") as u64,
            history,
        }))
    }

    async fn put_pointer(
        &self,
        previous: Option<&ChainPointer>,
        next: &ChainPointer,
    ) -> Result<(), StreamError> {
        let history = serde_json::to_string(&next.history)?;

        let result = match previous {
            None => sqlx::query(
                "INSERT INTO pointers
                    (network_id, block_hash, block_number, sequence_index, timestamp, history_json)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT (network_id) DO NOTHING",
            )
            .bind(next.network_id as i64)
            .bind(&next.block_hash)
            .bind(number_key(next.block_number))
            .bind(next.sequence_index as i64)
            .bind(next.timestamp)
            .bind(&history)
            .execute(&self.pool)
            .await
            .map_err(db_err)?,
            Some(prev) => sqlx::query(
                "UPDATE pointers
                 SET block_hash = ?, block_number = ?, sequence_index = ?,
                     timestamp = ?, history_json = ?
                 WHERE network_id = ? AND block_hash = ? AND block_number = ?
                   AND sequence_index = ?",
            )
            .bind(&next.block_hash)
            .bind(number_key(next.block_number))
            .bind(next.sequence_index as i64)
            .bind(next.timestamp)
            .bind(&history)
            .bind(prev.network_id as i64)
            .bind(&prev.block_hash)
            .bind(number_key(prev.block_number))
            .bind(prev.sequence_index as i64)
            .execute(&self.pool)
            .await
            .map_err(db_err)?,
        };

        if result.rows_affected() == 0 {
            return Err(StreamError::PointerConflict {
                network_id: next.network_id,
            });
        }
        debug!(
            network_id = next.network_id,
            block_number = %next.block_number,
            sequence_index = next.sequence_index,
            "pointer written"
        );
        Ok(())
    }

    async fn delete_pointer(&self, network_id: u64) -> Result<(), StreamError> {
        sqlx::query("DELETE FROM pointers WHERE network_id = ?")
            .bind(network_id as i64)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

// ─── Blocks ───────────────────────────────────────────────────────────────────

#[async_trait]
impl BlockStore for SqliteStorage {
    async fn metadata(
        &self,
        hash: &str,
        number: U256,
    ) -> Result<Option<BlockMetadata>, StreamError> {
        let row = sqlx::query(
            "SELECT hash, number, parent_hash FROM blocks WHERE hash = ? AND number = ?",
        )
        .bind(hash)
        .bind(number_key(number))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(Self::row_to_metadata).transpose()
    }

    async fn record(&self, hash: &str, number: U256) -> Result<Option<BlockRecord>, StreamError> {
        let key = number_key(number);
        let row = sqlx::query(
            "SELECT parent_hash, ttl, chunk_count FROM blocks WHERE hash = ? AND number = ?",
        )
        .bind(hash)
        .bind(&key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };

        let chunks = sqlx::query(
            "SELECT data FROM block_chunks WHERE hash = ? AND number = ? ORDER BY idx",
        )
        .bind(hash)
        .bind(&key)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let expected: i64 = row.get("chunk_count");
        if chunks.len() as i64 != expected {
            return Err(StreamError::Storage(format!(
                "block {hash}#{number}: {} of {expected} payload chunks present",
                chunks.len()
            )));
        }
        let mut payload = Vec::new();
        for chunk in &chunks {
            let data: Vec<u8> = chunk.get("data");
            payload.extend_from_slice(&data);
        }

        Ok(Some(BlockRecord {
            hash: hash.to_string(),
            number,
            parent_hash: row.get("parent_hash"),
            ttl: row.get("ttl"),
            payload,
        }))
    }

    async fn put_block(&self, record: BlockRecord) -> Result<PutOutcome, StreamError> {
        let key = number_key(record.number);
        let chunks = record.chunks(self.chunk_bytes);

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO blocks (hash, number, parent_hash, ttl, chunk_count)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.hash)
        .bind(&key)
        .bind(&record.parent_hash)
        .bind(record.ttl)
        .bind(chunks.len() as i64)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Ok(PutOutcome::AlreadyExists);
        }

        for (idx, chunk) in chunks.iter().enumerate() {
            sqlx::query("INSERT INTO block_chunks (hash, number, idx, data) VALUES (?, ?, ?, ?)")
                .bind(&record.hash)
                .bind(&key)
                .bind(idx as i64)
                .bind(*chunk)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        debug!(
            block_hash = %record.hash,
            block_number = %record.number,
            bytes = record.payload.len(),
            chunks = chunks.len(),
            "block stored"
        );
        Ok(PutOutcome::Inserted)
    }

    async fn blocks_at(&self, number: U256) -> Result<Vec<BlockMetadata>, StreamError> {
        let rows = sqlx::query(
            "SELECT hash, number, parent_hash FROM blocks WHERE number = ? ORDER BY hash",
        )
        .bind(number_key(number))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::row_to_metadata).collect()
    }
}

// ─── ABIs ─────────────────────────────────────────────────────────────────────

#[async_trait]
impl AbiStore for SqliteStorage {
    async fn get_abi(&self, address: &str) -> Result<Option<AbiRecord>, StreamError> {
        let address = address.to_lowercase();
        let row = sqlx::query("SELECT abi_json, expires_at FROM abis WHERE address = ?")
            .bind(&address)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };

        let abi_json: Option<String> = row.get("abi_json");
        let abi = abi_json
            .map(|text| serde_json::from_str::<ContractAbi>(&text))
            .transpose()?;
        Ok(Some(AbiRecord {
            address,
            abi,
            expires_at: row.get("expires_at"),
        }))
    }

    async fn put_abi(&self, record: AbiRecord) -> Result<(), StreamError> {
        let abi_json = match &record.abi {
            Some(abi) => {
                abi.validate()?;
                Some(serde_json::to_string(abi)?)
            }
            None => None,
        };
        sqlx::query(
            "INSERT INTO abis (address, abi_json, expires_at) VALUES (?, ?, ?)
             ON CONFLICT (address) DO UPDATE
             SET abi_json = excluded.abi_json, expires_at = excluded.expires_at",
        )
        .bind(record.address.to_lowercase())
        .bind(abi_json)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainstream_core::config::StreamConfig;
    use chainstream_core::types::{Block, BlockPayload, BlockTransactions};

    fn payload(hash: &str, number: u64, parent: &str, txs: usize) -> BlockPayload {
        BlockPayload {
            block: Block {
                hash: hash.into(),
                number: U256::from(number),
                parent_hash: parent.into(),
                timestamp: U256::ZERO,
                transactions: BlockTransactions::Hashes(
                    (0..txs).map(|i| format!("0x{i:064x}")).collect(),
                ),
                extra: Default::default(),
            },
            receipts: vec![],
        }
    }

    #[tokio::test]
    async fn pointer_cas_roundtrip() {
        let store = SqliteStorage::in_memory().await.unwrap();
        assert!(store.get_pointer(1).await.unwrap().is_none());

        let p0 = ChainPointer::first(1, "0xa", U256::from(100), 5);
        store.put_pointer(None, &p0).await.unwrap();
        assert!(store.put_pointer(None, &p0).await.unwrap_err().is_conflict());

        let p1 = p0.advance("0xb", U256::from(101), 32, 6);
        store.put_pointer(Some(&p0), &p1).await.unwrap();
        let lost = p0.advance("0xc", U256::from(101), 32, 7);
        assert!(store.put_pointer(Some(&p0), &lost).await.unwrap_err().is_conflict());

        let loaded = store.get_pointer(1).await.unwrap().unwrap();
        assert_eq!(loaded, p1);

        store.delete_pointer(1).await.unwrap();
        assert!(store.get_pointer(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chunked_block_roundtrip() {
        let store = SqliteStorage::in_memory().await.unwrap().with_chunk_bytes(64);
        let p = payload("0xb1", 7, "0xb0", 50);

        assert_eq!(store.put_payload(&p, 1_000).await.unwrap(), PutOutcome::Inserted);
        assert_eq!(store.put_payload(&p, 9_999).await.unwrap(), PutOutcome::AlreadyExists);

        let record = store.record("0xb1", U256::from(7)).await.unwrap().unwrap();
        assert_eq!(record.ttl, 1_000);
        assert_eq!(store.get_block("0xb1", U256::from(7)).await.unwrap().unwrap(), p);
        assert!(store.exists("0xb1", U256::from(7)).await.unwrap());
        assert!(!store.exists("0xb0", U256::from(6)).await.unwrap());
    }

    #[tokio::test]
    async fn chunk_size_follows_config() {
        let small = StreamConfig {
            max_block_chunk_bytes: 32,
            ..StreamConfig::default()
        };
        let store = SqliteStorage::in_memory()
            .await
            .unwrap()
            .with_chunk_bytes(small.max_block_chunk_bytes);
        let p = payload("0xc1", 9, "0xc0", 50);
        store.put_payload(&p, 1_000).await.unwrap();

        let record = store.record("0xc1", U256::from(9)).await.unwrap().unwrap();
        let rows = store.chunk_count("0xc1", U256::from(9)).await.unwrap();
        assert!(rows > 1, "{rows} chunk rows");
        assert_eq!(rows, record.payload.len().div_ceil(32));

        let default = SqliteStorage::in_memory().await.unwrap();
        default.put_payload(&p, 1_000).await.unwrap();
        assert_eq!(default.chunk_count("0xc1", U256::from(9)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn blocks_at_and_purge() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.put_payload(&payload("0xa5", 5, "0xa4", 1), 10).await.unwrap();
        store.put_payload(&payload("0xb5", 5, "0xa4", 1), 20).await.unwrap();

        let at5 = store.blocks_at(U256::from(5)).await.unwrap();
        assert_eq!(at5.len(), 2);
        assert_eq!(at5[0].hash, "0xa5");

        assert_eq!(store.purge_expired(10).await.unwrap(), 1);
        let at5 = store.blocks_at(U256::from(5)).await.unwrap();
        assert_eq!(at5.len(), 1);
        assert_eq!(at5[0].hash, "0xb5");
    }

    #[tokio::test]
    async fn abi_records() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store
            .put_abi(AbiRecord::unavailable("0xDEAD", 1_000, 0))
            .await
            .unwrap();
        let neg = store.get_abi("0xdead").await.unwrap().unwrap();
        assert!(!neg.is_available());
        assert_eq!(neg.expires_at, Some(1_000));

        let abi = ContractAbi::from_json(
            r#"[{"type":"event","name":"Ping","inputs":[{"name":"n","type":"uint8","indexed":false}]}]"#,
        )
        .unwrap();
        store.put_abi(AbiRecord::available("0xdead", abi.clone())).await.unwrap();
        let pos = store.get_abi("0xDEAD").await.unwrap().unwrap();
        assert_eq!(pos.abi, Some(abi));
        assert_eq!(pos.expires_at, None);
    }
}
