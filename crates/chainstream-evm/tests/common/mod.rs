#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use alloy_primitives::U256;
use async_trait::async_trait;

use chainstream_abi::{AbiRegistry, RegistryError, RegistryLookup};
use chainstream_core::abi::ContractAbi;
use chainstream_core::error::StreamError;
use chainstream_core::queue::{BatchLimits, OutgoingMessage, QueueTransport, ReceivedMessage};
use chainstream_core::types::{Block, BlockNumber, BlockTransactions, Log, Transaction, TransactionReceipt};
use chainstream_evm::ChainClient;
use chainstream_storage::InMemoryQueue;

pub const TOKEN: &str = "0x151202c9c18e495656f372281f493eb7698961d5";
pub const FROM: &str = "0xaa167e9382e1e4df1992209cb585abf66b22e4a9";
pub const TO: &str = "0x7ece447cd793bed325f1378baa6892ba68b35a84";
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
/// 668734457954955000000
pub const TRANSFER_VALUE_WORD: &str =
    "000000000000000000000000000000000000000000000024408e0e672c7d78c0";

pub const TOKEN_ABI: &str = r#"[
    {"type":"event","name":"Transfer","anonymous":false,"inputs":[
        {"name":"_from","type":"address","indexed":true},
        {"name":"_to","type":"address","indexed":true},
        {"name":"_value","type":"uint256","indexed":false}]},
    {"type":"function","name":"transfer","inputs":[
        {"name":"_to","type":"address"},{"name":"_value","type":"uint256"}],
     "outputs":[{"name":"","type":"bool"}]}
]"#;

// ─── Fixtures ─────────────────────────────────────────────────────────────────

/// 32-byte hash of block `n` on fork `tag` (a hex digit).
pub fn hash(tag: char, n: u64) -> String {
    format!("0x{tag}{n:063x}")
}

fn word(address: &str) -> String {
    format!("0x{:0>64}", address.trim_start_matches("0x"))
}

/// Block `n` of fork `tag` whose parent is block `n - 1` of fork `parent_tag`.
pub fn empty_block(tag: char, n: u64, parent_tag: char) -> Block {
    Block {
        hash: hash(tag, n),
        number: U256::from(n),
        parent_hash: hash(parent_tag, n - 1),
        timestamp: U256::from(1_600_000_000u64 + n * 12),
        transactions: BlockTransactions::Full(vec![]),
        extra: Default::default(),
    }
}

pub fn transfer_log(block: &Block, tx_hash: &str, index: u64) -> Log {
    Log {
        address: TOKEN.into(),
        topics: vec![TRANSFER_TOPIC.into(), word(FROM), word(TO)],
        data: format!("0x{TRANSFER_VALUE_WORD}"),
        block_number: block.number,
        block_hash: block.hash.clone(),
        transaction_hash: tx_hash.into(),
        transaction_index: U256::ZERO,
        log_index: U256::from(index),
        removed: false,
    }
}

/// Block `n` of fork `tag` holding one `transfer` call that emits `logs` Transfer events.
pub fn token_block(tag: char, n: u64, parent_tag: char, logs: u64) -> (Block, Vec<TransactionReceipt>) {
    let mut block = empty_block(tag, n, parent_tag);
    let tx_hash = format!("0xe{tag}{n:062x}");
    let tx = Transaction {
        hash: tx_hash.clone(),
        block_hash: Some(block.hash.clone()),
        block_number: Some(block.number),
        transaction_index: Some(U256::ZERO),
        from: FROM.into(),
        to: Some(TOKEN.into()),
        value: U256::ZERO,
        input: format!(
            "0xa9059cbb{}{TRANSFER_VALUE_WORD}",
            word(TO).trim_start_matches("0x")
        ),
        extra: Default::default(),
    };
    block.transactions = BlockTransactions::Full(vec![tx]);

    // receipts list logs in emission order; shuffle to prove the drain sorts
    let mut indices: Vec<u64> = (0..logs).collect();
    indices.reverse();
    let receipt = TransactionReceipt {
        transaction_hash: tx_hash.clone(),
        transaction_index: U256::ZERO,
        block_hash: block.hash.clone(),
        block_number: block.number,
        logs: indices
            .into_iter()
            .map(|i| transfer_log(&block, &tx_hash, i))
            .collect(),
        status: Some(U256::from(1)),
        extra: Default::default(),
    };
    (block, vec![receipt])
}

// ─── MockChain ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ChainState {
    head: u64,
    blocks: HashMap<u64, Block>,
    receipts: HashMap<String, TransactionReceipt>,
}

/// A scripted node: a canonical block per height that tests may replace.
pub struct MockChain {
    state: Mutex<ChainState>,
    network: String,
}

impl MockChain {
    pub fn new(network_id: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ChainState::default()),
            network: network_id.to_string(),
        })
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    /// Make `block` the canonical block at its height.
    pub fn insert(&self, block: Block, receipts: Vec<TransactionReceipt>) {
        let mut state = self.state.lock().unwrap();
        for r in receipts {
            state.receipts.insert(r.transaction_hash.clone(), r);
        }
        let n: u64 = block.number.to();
        state.blocks.insert(n, block);
    }

    /// Canonical empty blocks `from..=to` of fork `tag`.
    pub fn extend(&self, tag: char, from: u64, to: u64) {
        for n in from..=to {
            self.insert(empty_block(tag, n, tag), vec![]);
        }
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn block_number(&self) -> Result<BlockNumber, StreamError> {
        Ok(U256::from(self.state.lock().unwrap().head))
    }

    async fn block_by_number(
        &self,
        number: BlockNumber,
        _full_transactions: bool,
    ) -> Result<Option<Block>, StreamError> {
        let n: u64 = number.to();
        Ok(self.state.lock().unwrap().blocks.get(&n).cloned())
    }

    async fn transaction_receipts(
        &self,
        hashes: &[String],
    ) -> Result<Vec<TransactionReceipt>, StreamError> {
        let state = self.state.lock().unwrap();
        hashes
            .iter()
            .map(|h| {
                state
                    .receipts
                    .get(h)
                    .cloned()
                    .ok_or_else(|| StreamError::Rpc(format!("no receipt for {h}")))
            })
            .collect()
    }

    async fn net_version(&self) -> Result<String, StreamError> {
        Ok(self.network.clone())
    }

    async fn client_version(&self) -> Result<String, StreamError> {
        Ok("MockChain/v0".into())
    }
}

// ─── FlakyQueue ───────────────────────────────────────────────────────────────

/// An [`InMemoryQueue`] that fails scripted operations.
pub struct FlakyQueue {
    pub inner: InMemoryQueue,
    failing_acks: AtomicU32,
    failing_sends: Mutex<HashMap<String, u32>>,
}

impl FlakyQueue {
    pub fn new(inner: InMemoryQueue) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing_acks: AtomicU32::new(0),
            failing_sends: Mutex::new(HashMap::new()),
        })
    }

    pub fn fail_acks(&self, times: u32) {
        self.failing_acks.store(times, Ordering::SeqCst);
    }

    pub fn fail_sends_to(&self, queue: &str, times: u32) {
        self.failing_sends
            .lock()
            .unwrap()
            .insert(queue.to_string(), times);
    }

    fn take_send_failure(&self, queue: &str) -> bool {
        let mut failing = self.failing_sends.lock().unwrap();
        match failing.get_mut(queue) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl QueueTransport for FlakyQueue {
    async fn send(&self, queue: &str, message: OutgoingMessage) -> Result<String, StreamError> {
        if self.take_send_failure(queue) {
            return Err(StreamError::Queue("injected send failure".into()));
        }
        self.inner.send(queue, message).await
    }

    async fn send_batch(
        &self,
        queue: &str,
        messages: Vec<OutgoingMessage>,
    ) -> Result<(), StreamError> {
        if self.take_send_failure(queue) {
            return Err(StreamError::Queue("injected batch failure".into()));
        }
        self.inner.send_batch(queue, messages).await
    }

    async fn receive(&self, queue: &str, max: usize) -> Result<Vec<ReceivedMessage>, StreamError> {
        self.inner.receive(queue, max).await
    }

    async fn ack(&self, queue: &str, message: &ReceivedMessage) -> Result<(), StreamError> {
        let pending = self.failing_acks.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_acks.store(pending - 1, Ordering::SeqCst);
            return Err(StreamError::Queue("injected ack failure".into()));
        }
        self.inner.ack(queue, message).await
    }

    fn batch_limits(&self) -> BatchLimits {
        self.inner.batch_limits()
    }
}

// ─── MockRegistry ─────────────────────────────────────────────────────────────

/// Knows the token ABI and nothing else.
#[derive(Default)]
pub struct MockRegistry {
    calls: AtomicUsize,
}

impl MockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AbiRegistry for MockRegistry {
    async fn fetch_abi(&self, address: &str) -> Result<RegistryLookup, RegistryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if address.eq_ignore_ascii_case(TOKEN) {
            let abi = ContractAbi::from_json(TOKEN_ABI)
                .map_err(|e| RegistryError::InvalidAbi(e.to_string()))?;
            Ok(RegistryLookup::Found(abi))
        } else {
            Ok(RegistryLookup::NotAvailable)
        }
    }
}
