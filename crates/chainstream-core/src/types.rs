//! Shared types for the streaming pipeline.
//!
//! Shapes follow the Ethereum JSON-RPC wire format (camelCase keys, `0x` hex
//! quantities). Fields the engine does not interpret are kept verbatim in an
//! `extra` map so that downstream consumers receive the node's full record.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current wall-clock time in milliseconds since epoch.
pub fn unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Block numbers, log indices and every other RPC quantity.
///
/// Serialised as a `0x`-prefixed hex string.
pub type BlockNumber = U256;

// ─── Log ──────────────────────────────────────────────────────────────────────

/// An event log as reported inside a transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    /// Emitting contract (`0x…`, 20 bytes).
    pub address: String,
    /// Indexed topics; `topics[0]` is the event signature hash for non-anonymous events.
    pub topics: Vec<String>,
    /// ABI-encoded non-indexed parameters.
    pub data: String,
    pub block_number: BlockNumber,
    pub block_hash: String,
    pub transaction_hash: String,
    pub transaction_index: BlockNumber,
    pub log_index: BlockNumber,
    /// `true` when the log is being retracted because of a reorg.
    #[serde(default)]
    pub removed: bool,
}

// ─── Transaction ──────────────────────────────────────────────────────────────

/// A transaction object as returned by `eth_getBlockByNumber(n, true)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: String,
    #[serde(default)]
    pub block_hash: Option<String>,
    #[serde(default)]
    pub block_number: Option<BlockNumber>,
    #[serde(default)]
    pub transaction_index: Option<BlockNumber>,
    pub from: String,
    /// `None` for contract creations.
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub value: U256,
    /// Calldata (`0x…`).
    #[serde(default)]
    pub input: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ─── TransactionReceipt ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: String,
    pub transaction_index: BlockNumber,
    pub block_hash: String,
    pub block_number: BlockNumber,
    #[serde(default)]
    pub logs: Vec<Log>,
    /// `0x1` success, `0x0` failure; absent before Byzantium.
    #[serde(default)]
    pub status: Option<U256>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ─── Block ────────────────────────────────────────────────────────────────────

/// The transactions list of a block.
///
/// Which variant a node returns is decided by the `include_full_transactions`
/// flag of the fetch, never guessed from the payload.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BlockTransactions {
    Full(Vec<Transaction>),
    Hashes(Vec<String>),
}

// An empty list carries no variant information on the wire.
impl PartialEq for BlockTransactions {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Full(a), Self::Full(b)) => a == b,
            (Self::Hashes(a), Self::Hashes(b)) => a == b,
            _ => self.is_empty() && other.is_empty(),
        }
    }
}

impl Default for BlockTransactions {
    fn default() -> Self {
        Self::Hashes(Vec::new())
    }
}

impl BlockTransactions {
    pub fn len(&self) -> usize {
        match self {
            Self::Full(txs) => txs.len(),
            Self::Hashes(hashes) => hashes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Transaction hashes in block order, whichever variant this is.
    pub fn hashes(&self) -> Vec<String> {
        match self {
            Self::Full(txs) => txs.iter().map(|tx| tx.hash.clone()).collect(),
            Self::Hashes(hashes) => hashes.clone(),
        }
    }

    /// Full transaction objects; empty for the hashes-only variant.
    pub fn full(&self) -> &[Transaction] {
        match self {
            Self::Full(txs) => txs,
            Self::Hashes(_) => &[],
        }
    }
}

/// A block header plus its transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub hash: String,
    pub number: BlockNumber,
    pub parent_hash: String,
    #[serde(default)]
    pub timestamp: U256,
    #[serde(default)]
    pub transactions: BlockTransactions,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The unit persisted per block: the block itself and all of its receipts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPayload {
    pub block: Block,
    pub receipts: Vec<TransactionReceipt>,
}

impl BlockPayload {
    /// All logs of the block, in receipt order.
    pub fn logs(&self) -> Vec<Log> {
        self.receipts
            .iter()
            .flat_map(|r| r.logs.iter().cloned())
            .collect()
    }
}

// ─── Decoded output ───────────────────────────────────────────────────────────

/// The decoded form of a log or call: the ABI member name and its arguments.
///
/// `parameters` carries each argument twice, under its position (`"0"`, `"1"`…)
/// and under its declared name when it has one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decoded {
    pub name: String,
    pub parameters: Map<String, Value>,
}

/// A log as published to the log output queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedLog {
    #[serde(flatten)]
    pub log: Log,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decoded: Option<Decoded>,
}

impl DecodedLog {
    /// Wrap a log without any decoding.
    pub fn raw(log: Log) -> Self {
        Self { log, decoded: None }
    }
}

/// A transaction as published to the transaction output queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedTransaction {
    #[serde(flatten)]
    pub transaction: Transaction,
    pub removed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decoded: Option<Decoded>,
}

impl DecodedTransaction {
    pub fn raw(transaction: Transaction, removed: bool) -> Self {
        Self {
            transaction,
            removed,
            decoded: None,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn block_json(transactions: Value) -> Value {
        json!({
            "hash": "0x01",
            "number": "0x64",
            "parentHash": "0x00",
            "timestamp": "0x5f5e100",
            "miner": "0x0000000000000000000000000000000000000000",
            "transactions": transactions,
        })
    }

    #[test]
    fn block_with_hashes_parses() {
        let block: Block = serde_json::from_value(block_json(json!(["0xaa", "0xbb"]))).unwrap();
        assert_eq!(block.number, U256::from(100));
        assert!(matches!(block.transactions, BlockTransactions::Hashes(_)));
        assert_eq!(block.transactions.hashes(), vec!["0xaa", "0xbb"]);
        assert!(block.transactions.full().is_empty());
        assert!(block.extra.contains_key("miner"));
    }

    #[test]
    fn block_with_full_transactions_parses() {
        let tx = json!({
            "hash": "0xaa",
            "from": "0x1111111111111111111111111111111111111111",
            "to": null,
            "value": "0x0",
            "input": "0x",
            "nonce": "0x1",
        });
        let block: Block = serde_json::from_value(block_json(json!([tx]))).unwrap();
        let full = block.transactions.full();
        assert_eq!(full.len(), 1);
        assert!(full[0].to.is_none());
        assert_eq!(full[0].extra.get("nonce"), Some(&json!("0x1")));
        assert_eq!(block.transactions.hashes(), vec!["0xaa"]);
    }

    #[test]
    fn numbers_serialize_as_hex() {
        let log = Log {
            address: "0x01".into(),
            topics: vec![],
            data: "0x".into(),
            block_number: U256::from(255),
            block_hash: "0xbb".into(),
            transaction_hash: "0xcc".into(),
            transaction_index: U256::ZERO,
            log_index: U256::from(2),
            removed: false,
        };
        let v = serde_json::to_value(&log).unwrap();
        assert_eq!(v["blockNumber"], json!("0xff"));
        assert_eq!(v["logIndex"], json!("0x2"));
    }

    #[test]
    fn missing_removed_defaults_to_false() {
        let log: Log = serde_json::from_value(json!({
            "address": "0x01",
            "topics": [],
            "data": "0x",
            "blockNumber": "0x1",
            "blockHash": "0xbb",
            "transactionHash": "0xcc",
            "transactionIndex": "0x0",
            "logIndex": "0x0",
        }))
        .unwrap();
        assert!(!log.removed);
    }

    #[test]
    fn payload_flattens_logs_in_receipt_order() {
        let log = |i: u64| Log {
            address: "0x01".into(),
            topics: vec![],
            data: "0x".into(),
            block_number: U256::from(1),
            block_hash: "0xbb".into(),
            transaction_hash: format!("0x{i}"),
            transaction_index: U256::from(i),
            log_index: U256::from(i),
            removed: false,
        };
        let receipt = |i: u64| TransactionReceipt {
            transaction_hash: format!("0x{i}"),
            transaction_index: U256::from(i),
            block_hash: "0xbb".into(),
            block_number: U256::from(1),
            logs: vec![log(i)],
            status: Some(U256::from(1)),
            extra: Map::new(),
        };
        let payload = BlockPayload {
            block: serde_json::from_value(block_json(json!([]))).unwrap(),
            receipts: vec![receipt(0), receipt(1)],
        };
        let logs = payload.logs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].log_index, U256::from(1));
    }
}
