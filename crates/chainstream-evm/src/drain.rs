//! Dedup fan-out: pointer messages in, decoded log and transaction messages out.
//!
//! For each pointer message the stored payload is read back, every log and
//! transaction is decoded (fail-open) and published with a content-addressed
//! id, so redelivering the same pointer message never duplicates downstream.
//! Retractions are published in reverse order. The pointer message is
//! acknowledged only after everything was published.
//!
//! Messages of one receive are prepared concurrently but published strictly
//! in order, and the run stops at the first failure so nothing overtakes a
//! message that is waiting for redelivery.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use chainstream_abi::decoder::{decode_log, decode_transaction, is_contract_call};
use chainstream_abi::AbiResolver;
use chainstream_core::abi::ContractAbi;
use chainstream_core::block::BlockStore;
use chainstream_core::config::StreamConfig;
use chainstream_core::error::StreamError;
use chainstream_core::queue::{
    chunk_messages, network_group_key, OutgoingMessage, PointerMessage, QueueTransport,
    ReceivedMessage,
};
use chainstream_core::state::{DrainReport, DrainStatus};
use chainstream_core::types::{DecodedLog, DecodedTransaction, Log, Transaction};

use crate::notify::decode_pointer_message;

/// Content-addressed id of a published log.
///
/// SHA-256 over block hash, transaction hash, log index and the removed flag.
pub fn log_message_id(log: &Log) -> String {
    let mut hasher = Sha256::new();
    hasher.update(log.block_hash.to_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(log.transaction_hash.to_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(format!("{:#x}", log.log_index).as_bytes());
    hasher.update(b"|");
    hasher.update(if log.removed { b"true" as &[u8] } else { b"false" });
    hex::encode(hasher.finalize())
}

/// Content-addressed id of a published transaction: `"{hash}-{removed}"`.
pub fn transaction_message_id(tx: &Transaction, removed: bool) -> String {
    format!("{}-{}", tx.hash.to_lowercase(), removed)
}

/// Everything one pointer message turns into, ready to publish.
#[derive(Debug)]
struct Prepared {
    pointer: PointerMessage,
    logs: Vec<OutgoingMessage>,
    transactions: Vec<OutgoingMessage>,
}

/// Consumes the new-block queue and fans blocks out to the log and
/// transaction queues.
pub struct Drainer {
    config: StreamConfig,
    blocks: Arc<dyn BlockStore>,
    queue: Arc<dyn QueueTransport>,
    resolver: Arc<AbiResolver>,
}

impl Drainer {
    pub fn new(
        config: StreamConfig,
        blocks: Arc<dyn BlockStore>,
        queue: Arc<dyn QueueTransport>,
        resolver: Arc<AbiResolver>,
    ) -> Self {
        Self {
            config,
            blocks,
            queue,
            resolver,
        }
    }

    /// Drain up to `max_messages` pointer messages, stopping early once less
    /// than `min_remaining_budget_ms` of `budget` is left.
    pub async fn drain(&self, max_messages: usize, budget: Duration) -> DrainReport {
        let deadline = Instant::now() + budget;
        let min_remaining = Duration::from_millis(self.config.min_remaining_budget_ms);
        let source = self.config.new_block_queue.as_str();
        let mut report = DrainReport::new(DrainStatus::Empty);

        loop {
            if report.processed >= max_messages {
                report.status = DrainStatus::LimitReached;
                break;
            }
            if deadline.saturating_duration_since(Instant::now()) < min_remaining {
                report.status = DrainStatus::BudgetExhausted;
                break;
            }

            let want = (max_messages - report.processed).min(self.config.drain_batch_size);
            let received = match self.queue.receive(source, want).await {
                Ok(r) => r,
                Err(e) => {
                    report.status = DrainStatus::Failed {
                        message_id: None,
                        reason: e.to_string(),
                    };
                    break;
                }
            };
            if received.is_empty() {
                report.status = DrainStatus::Empty;
                break;
            }
            debug!(queue = source, count = received.len(), "pointer messages received");

            let prepared: Vec<Result<Prepared, StreamError>> = stream::iter(0..received.len())
                .map(|i| self.prepare(&received[i]))
                .buffered(self.config.drain_concurrency)
                .collect()
                .await;

            let mut failure = None;
            for (message, prepared) in received.iter().zip(prepared) {
                let result = match prepared {
                    Ok(p) => self.publish_and_ack(message, p).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok((logs, transactions)) => {
                        report.processed += 1;
                        report.logs_published += logs;
                        report.transactions_published += transactions;
                    }
                    Err(e) => {
                        warn!(
                            message_id = %message.message_id,
                            receive_count = message.receive_count,
                            error = %e,
                            "pointer message failed, leaving it for redelivery"
                        );
                        failure = Some(DrainStatus::Failed {
                            message_id: Some(message.message_id.clone()),
                            reason: e.to_string(),
                        });
                        break;
                    }
                }
            }
            if let Some(status) = failure {
                report.status = status;
                break;
            }
        }

        info!(
            processed = report.processed,
            logs = report.logs_published,
            transactions = report.transactions_published,
            status = ?report.status,
            "drain finished"
        );
        report
    }

    /// Fully handle one received pointer message: publish, then acknowledge.
    ///
    /// Returns the number of logs and transactions published.
    pub async fn process(&self, message: &ReceivedMessage) -> Result<(usize, usize), StreamError> {
        let prepared = self.prepare(message).await?;
        self.publish_and_ack(message, prepared).await
    }

    async fn prepare(&self, message: &ReceivedMessage) -> Result<Prepared, StreamError> {
        let pointer = decode_pointer_message(&message.body)?;
        let removed = pointer.removed;
        let payload = self
            .blocks
            .get_block(&pointer.hash, pointer.number)
            .await?
            .ok_or_else(|| {
                StreamError::not_found(format!("block {}#{}", pointer.hash, pointer.number))
            })?;

        let mut logs = payload.logs();
        for log in &mut logs {
            log.removed = removed;
        }
        logs.sort_by_key(|l| l.log_index);

        let transactions = payload.block.transactions.full().to_vec();
        if transactions.is_empty() && !payload.block.transactions.is_empty() {
            warn!(block_hash = %pointer.hash, "block stored without transaction objects");
        }

        let abis = self.resolve_abis(&logs, &transactions).await;
        let abi_for = |address: &str| abis.get(&address.to_lowercase()).cloned().flatten();
        let group = network_group_key(self.config.network_id);

        let mut log_messages = Vec::with_capacity(logs.len());
        for log in logs {
            let id = log_message_id(&log);
            let decoded = match abi_for(&log.address) {
                Some(abi) => decode_log(&log, &abi),
                None => DecodedLog::raw(log),
            };
            let body = serde_json::to_string(&decoded)?;
            log_messages.push(OutgoingMessage::content_addressed(id, group.clone(), body));
        }

        let mut tx_messages = Vec::with_capacity(transactions.len());
        for tx in transactions {
            let id = transaction_message_id(&tx, removed);
            let abi = tx
                .to
                .as_deref()
                .filter(|_| is_contract_call(&tx))
                .and_then(|to| abi_for(to));
            let decoded = match abi {
                Some(abi) => decode_transaction(&tx, &abi, removed),
                None => DecodedTransaction::raw(tx, removed),
            };
            let body = serde_json::to_string(&decoded)?;
            tx_messages.push(OutgoingMessage::content_addressed(id, group.clone(), body));
        }

        if removed {
            log_messages.reverse();
            tx_messages.reverse();
        }
        Ok(Prepared {
            pointer,
            logs: log_messages,
            transactions: tx_messages,
        })
    }

    /// One resolver call per distinct contract touched by the block.
    async fn resolve_abis(
        &self,
        logs: &[Log],
        transactions: &[Transaction],
    ) -> HashMap<String, Option<Arc<ContractAbi>>> {
        let mut addresses: HashSet<String> =
            logs.iter().map(|l| l.address.to_lowercase()).collect();
        addresses.extend(
            transactions
                .iter()
                .filter(|tx| is_contract_call(tx))
                .filter_map(|tx| tx.to.as_ref().map(|to| to.to_lowercase())),
        );

        let resolver = &self.resolver;
        stream::iter(addresses)
            .map(|address| async move {
                let abi = resolver.resolve(&address).await;
                (address, abi)
            })
            .buffer_unordered(self.config.drain_concurrency)
            .collect()
            .await
    }

    async fn publish_and_ack(
        &self,
        message: &ReceivedMessage,
        prepared: Prepared,
    ) -> Result<(usize, usize), StreamError> {
        let limits = self.queue.batch_limits();
        let log_count = prepared.logs.len();
        let tx_count = prepared.transactions.len();

        for batch in chunk_messages(prepared.logs, &limits) {
            self.queue.send_batch(&self.config.log_queue, batch).await?;
        }
        for batch in chunk_messages(prepared.transactions, &limits) {
            self.queue
                .send_batch(&self.config.transaction_queue, batch)
                .await?;
        }
        self.queue
            .ack(&self.config.new_block_queue, message)
            .await?;

        debug!(
            block_hash = %prepared.pointer.hash,
            block_number = %prepared.pointer.number,
            removed = prepared.pointer.removed,
            logs = log_count,
            transactions = tx_count,
            "block fanned out"
        );
        Ok((log_count, tx_count))
    }
}
