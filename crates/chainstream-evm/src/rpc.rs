//! HTTP JSON-RPC [`ChainClient`] backed by `reqwest`.
//!
//! Features:
//! - automatic retry with exponential backoff for transport failures
//! - receipts fetched with true HTTP batching
//! - shape checks on everything the engine later trusts (hash and address
//!   widths, topic counts), so a misbehaving node aborts the tick instead of
//!   corrupting stored data

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use chainstream_core::error::StreamError;
use chainstream_core::types::{Block, BlockNumber, Log, TransactionReceipt};

use crate::client::ChainClient;
use crate::retry::{retry, RetryConfig, RetryPolicy};

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    method: String,
    params: Vec<Value>,
    id: u64,
}

impl JsonRpcRequest {
    fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
            id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    fn into_result(self, method: &str) -> Result<Value, StreamError> {
        match self.error {
            Some(err) => Err(StreamError::Rpc(format!(
                "{method}: JSON-RPC error {}: {}",
                err.code, err.message
            ))),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

// ─── Client ───────────────────────────────────────────────────────────────────

/// Configuration for [`HttpChainClient`].
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub retry: RetryConfig,
    pub request_timeout: Duration,
    /// Receipts requested per HTTP batch.
    pub max_batch_size: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(30),
            max_batch_size: 100,
        }
    }
}

/// JSON-RPC client for one node endpoint.
pub struct HttpChainClient {
    url: String,
    http: reqwest::Client,
    retry: RetryPolicy,
    max_batch_size: usize,
    next_id: AtomicU64,
}

impl HttpChainClient {
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> Result<Self, StreamError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| StreamError::Rpc(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
            retry: RetryPolicy::new(config.retry),
            max_batch_size: config.max_batch_size.max(1),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn default_for(url: impl Into<String>) -> Result<Self, StreamError> {
        Self::new(url, HttpClientConfig::default())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn post<B: Serialize + ?Sized, R: for<'de> Deserialize<'de>>(
        &self,
        body: &B,
    ) -> Result<R, StreamError> {
        let resp = self
            .http
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| StreamError::Rpc(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(StreamError::Rpc(format!("HTTP {status}: {body}")));
        }
        resp.json::<R>()
            .await
            .map_err(|e| StreamError::Rpc(format!("undecodable response: {e}")))
    }

    /// One call, retried on transport failures.
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, StreamError> {
        let req = JsonRpcRequest::new(self.next_id(), method, params);
        let resp: JsonRpcResponse = retry(&self.retry, method, || self.post(&req)).await?;
        resp.into_result(method)
    }

    /// A batch of calls; results come back in request order.
    async fn call_batch(&self, reqs: Vec<JsonRpcRequest>) -> Result<Vec<Value>, StreamError> {
        if reqs.is_empty() {
            return Ok(Vec::new());
        }
        let mut responses: Vec<JsonRpcResponse> =
            retry(&self.retry, "batch", || self.post(&reqs)).await?;
        if responses.len() != reqs.len() {
            return Err(StreamError::Rpc(format!(
                "batch of {} requests got {} responses",
                reqs.len(),
                responses.len()
            )));
        }
        // servers may answer a batch in any order
        responses.sort_by_key(|r| r.id.as_u64().unwrap_or(u64::MAX));
        reqs.iter()
            .zip(responses)
            .map(|(req, resp)| {
                if resp.id.as_u64() != Some(req.id) {
                    return Err(StreamError::Rpc(format!(
                        "batch response ids do not match request {}",
                        req.id
                    )));
                }
                resp.into_result(&req.method)
            })
            .collect()
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn block_number(&self) -> Result<BlockNumber, StreamError> {
        let v = self.call("eth_blockNumber", vec![]).await?;
        parse_quantity(&v)
    }

    async fn block_by_number(
        &self,
        number: BlockNumber,
        full_transactions: bool,
    ) -> Result<Option<Block>, StreamError> {
        let v = self
            .call(
                "eth_getBlockByNumber",
                vec![json!(format!("{number:#x}")), json!(full_transactions)],
            )
            .await?;
        if v.is_null() {
            return Ok(None);
        }
        let block: Block = serde_json::from_value(v)
            .map_err(|e| StreamError::Rpc(format!("malformed block #{number}: {e}")))?;
        check_block(&block)?;
        Ok(Some(block))
    }

    async fn transaction_receipts(
        &self,
        hashes: &[String],
    ) -> Result<Vec<TransactionReceipt>, StreamError> {
        let mut receipts = Vec::with_capacity(hashes.len());
        for chunk in hashes.chunks(self.max_batch_size) {
            let reqs = chunk
                .iter()
                .map(|h| JsonRpcRequest::new(self.next_id(), "eth_getTransactionReceipt", vec![json!(h)]))
                .collect();
            let values = self.call_batch(reqs).await?;
            for (hash, value) in chunk.iter().zip(values) {
                if value.is_null() {
                    return Err(StreamError::Rpc(format!("node has no receipt for {hash}")));
                }
                let receipt: TransactionReceipt = serde_json::from_value(value)
                    .map_err(|e| StreamError::Rpc(format!("malformed receipt {hash}: {e}")))?;
                check_receipt(&receipt)?;
                if !receipt.transaction_hash.eq_ignore_ascii_case(hash) {
                    return Err(StreamError::Rpc(format!(
                        "asked for receipt {hash}, got {}",
                        receipt.transaction_hash
                    )));
                }
                receipts.push(receipt);
            }
        }
        debug!(count = receipts.len(), "receipts fetched");
        Ok(receipts)
    }

    async fn net_version(&self) -> Result<String, StreamError> {
        let v = self.call("net_version", vec![]).await?;
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| StreamError::Rpc(format!("net_version returned {v}")))
    }

    async fn client_version(&self) -> Result<String, StreamError> {
        let v = self.call("web3_clientVersion", vec![]).await?;
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| StreamError::Rpc(format!("web3_clientVersion returned {v}")))
    }
}

// ─── Shape checks ─────────────────────────────────────────────────────────────

/// Parse a `0x` hex quantity.
pub fn parse_quantity(v: &Value) -> Result<U256, StreamError> {
    let s = v
        .as_str()
        .ok_or_else(|| StreamError::Rpc(format!("expected a hex quantity, got {v}")))?;
    let digits = s
        .strip_prefix("0x")
        .ok_or_else(|| StreamError::Rpc(format!("quantity without 0x prefix: {s}")))?;
    U256::from_str_radix(digits, 16).map_err(|e| StreamError::Rpc(format!("bad quantity {s}: {e}")))
}

/// `0x` followed by exactly `bytes` bytes of hex.
pub fn is_hex_of_len(s: &str, bytes: usize) -> bool {
    s.strip_prefix("0x").map_or(false, |h| {
        h.len() == bytes * 2 && h.bytes().all(|b| b.is_ascii_hexdigit())
    })
}

/// `0x` followed by whole bytes of hex, possibly none.
pub fn is_hex_data(s: &str) -> bool {
    s.strip_prefix("0x").map_or(false, |h| {
        h.len() % 2 == 0 && h.bytes().all(|b| b.is_ascii_hexdigit())
    })
}

fn require(ok: bool, what: impl FnOnce() -> String) -> Result<(), StreamError> {
    if ok {
        Ok(())
    } else {
        Err(StreamError::Rpc(format!("malformed node data: {}", what())))
    }
}

pub fn check_block(block: &Block) -> Result<(), StreamError> {
    require(is_hex_of_len(&block.hash, 32), || format!("block hash {}", block.hash))?;
    require(is_hex_of_len(&block.parent_hash, 32), || {
        format!("parent hash {}", block.parent_hash)
    })?;
    for hash in block.transactions.hashes() {
        require(is_hex_of_len(&hash, 32), || format!("transaction hash {hash}"))?;
    }
    for tx in block.transactions.full() {
        require(is_hex_of_len(&tx.from, 20), || format!("sender {}", tx.from))?;
        if let Some(to) = &tx.to {
            require(is_hex_of_len(to, 20), || format!("recipient {to}"))?;
        }
        require(is_hex_data(&tx.input), || format!("input of {}", tx.hash))?;
    }
    Ok(())
}

pub fn check_receipt(receipt: &TransactionReceipt) -> Result<(), StreamError> {
    require(is_hex_of_len(&receipt.transaction_hash, 32), || {
        format!("receipt transaction hash {}", receipt.transaction_hash)
    })?;
    require(is_hex_of_len(&receipt.block_hash, 32), || {
        format!("receipt block hash {}", receipt.block_hash)
    })?;
    receipt.logs.iter().try_for_each(check_log)
}

pub fn check_log(log: &Log) -> Result<(), StreamError> {
    require(is_hex_of_len(&log.address, 20), || format!("log address {}", log.address))?;
    require(is_hex_of_len(&log.block_hash, 32), || format!("log block hash {}", log.block_hash))?;
    require(is_hex_of_len(&log.transaction_hash, 32), || {
        format!("log transaction hash {}", log.transaction_hash)
    })?;
    require(log.topics.len() <= 4, || format!("{} topics on one log", log.topics.len()))?;
    for topic in &log.topics {
        require(is_hex_of_len(topic, 32), || format!("topic {topic}"))?;
    }
    require(log.data.starts_with("0x"), || format!("log data {}", log.data))
}
