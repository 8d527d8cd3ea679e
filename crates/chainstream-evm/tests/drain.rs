mod common;

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use serde_json::Value;
use tokio::sync::watch;

use chainstream_abi::AbiResolver;
use chainstream_core::block::BlockStore;
use chainstream_core::config::StreamConfig;
use chainstream_core::queue::{PointerMessage, QueueTransport};
use chainstream_core::state::DrainStatus;
use chainstream_core::types::{BlockPayload, DecodedLog};
use chainstream_evm::{
    notify_block, run_drain_worker, ChannelTrigger, DrainTrigger, Drainer, RetryPolicy,
    StreamConfigBuilder,
};
use chainstream_storage::{InMemoryQueue, InMemoryStorage};

use common::{hash, token_block, FlakyQueue, MockRegistry, TOKEN};

const MINUTE: Duration = Duration::from_secs(60);

fn config() -> StreamConfig {
    StreamConfigBuilder::new()
        .network_id(1)
        .drain_batch_size(4)
        .drain_concurrency(2)
        .build()
        .unwrap()
}

struct Harness {
    storage: Arc<InMemoryStorage>,
    queue: Arc<FlakyQueue>,
    registry: Arc<MockRegistry>,
    drainer: Drainer,
}

fn harness() -> Harness {
    let storage = Arc::new(InMemoryStorage::new());
    let queue = FlakyQueue::new(InMemoryQueue::with_timeouts(
        Duration::from_secs(30),
        Duration::from_secs(300),
    ));
    let registry = MockRegistry::new();
    let resolver = Arc::new(AbiResolver::new(
        storage.clone(),
        registry.clone(),
        config().abi_unavailable_ttl_ms(),
    ));
    let drainer = Drainer::new(config(), storage.clone(), queue.clone(), resolver);
    Harness {
        storage,
        queue,
        registry,
        drainer,
    }
}

impl Harness {
    /// Store block `n` with three Transfer logs.
    async fn store_block(&self, n: u64) {
        let (block, receipts) = token_block('a', n, 'a', 3);
        self.storage
            .put_payload(&BlockPayload { block, receipts }, i64::MAX)
            .await
            .unwrap();
    }

    async fn announce(&self, message: PointerMessage) {
        notify_block(
            self.queue.as_ref(),
            "new-blocks",
            1,
            &message,
            &RetryPolicy::none(),
        )
        .await
        .unwrap();
    }

    fn logs(&self) -> Vec<DecodedLog> {
        self.queue
            .inner
            .peek_bodies("log-firehose")
            .iter()
            .map(|b| serde_json::from_str(b).unwrap())
            .collect()
    }

    fn transactions(&self) -> Vec<Value> {
        self.queue
            .inner
            .peek_bodies("transaction-firehose")
            .iter()
            .map(|b| serde_json::from_str(b).unwrap())
            .collect()
    }
}

fn indices(logs: &[DecodedLog]) -> Vec<(u64, bool)> {
    logs.iter()
        .map(|l| (l.log.log_index.to::<u64>(), l.log.removed))
        .collect()
}

#[tokio::test]
async fn publishes_in_order_and_retracts_in_reverse() {
    let h = harness();
    h.store_block(100).await;
    h.announce(PointerMessage::added(hash('a', 100), U256::from(100)))
        .await;
    h.announce(PointerMessage::retracted(hash('a', 100), U256::from(100)))
        .await;

    let report = h.drainer.drain(10, MINUTE).await;
    assert_eq!(report.status, DrainStatus::Empty);
    assert_eq!(report.processed, 2);
    assert_eq!(report.logs_published, 6);
    assert_eq!(report.transactions_published, 2);

    assert_eq!(
        indices(&h.logs()),
        vec![
            (0, false),
            (1, false),
            (2, false),
            (2, true),
            (1, true),
            (0, true)
        ]
    );
    let txs = h.transactions();
    assert_eq!(txs.len(), 2);
    assert_eq!(txs[0]["removed"], false);
    assert_eq!(txs[1]["removed"], true);
    assert!(h.queue.inner.is_empty("new-blocks"));
}

#[tokio::test]
async fn decodes_with_the_registry_abi() {
    let h = harness();
    h.store_block(100).await;
    h.announce(PointerMessage::added(hash('a', 100), U256::from(100)))
        .await;
    h.drainer.drain(10, MINUTE).await;

    let logs = h.logs();
    let decoded = logs[0].decoded.as_ref().unwrap();
    assert_eq!(decoded.name, "Transfer");
    assert_eq!(
        decoded.parameters["_to"],
        "0x7eCE447cD793BED325f1378BaA6892bA68B35A84"
    );
    assert_eq!(decoded.parameters["_value"], "668734457954955000000");

    let tx = &h.transactions()[0];
    assert_eq!(tx["to"], TOKEN);
    assert_eq!(tx["decoded"]["name"], "transfer");
    assert_eq!(tx["decoded"]["parameters"]["_value"], "668734457954955000000");

    // one contract, one lookup for all its logs and calls
    assert_eq!(h.registry.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn redelivery_after_a_failed_ack_publishes_nothing_twice() {
    let h = harness();
    h.store_block(100).await;
    h.announce(PointerMessage::added(hash('a', 100), U256::from(100)))
        .await;

    h.queue.fail_acks(1);
    let report = h.drainer.drain(10, MINUTE).await;
    assert!(matches!(
        report.status,
        DrainStatus::Failed {
            message_id: Some(_),
            ..
        }
    ));
    assert_eq!(report.processed, 0);
    assert_eq!(h.logs().len(), 3);

    // still in flight
    assert_eq!(h.drainer.drain(10, MINUTE).await.status, DrainStatus::Empty);

    tokio::time::advance(Duration::from_secs(31)).await;
    let report = h.drainer.drain(10, MINUTE).await;
    assert_eq!(report.processed, 1);
    assert_eq!(report.status, DrainStatus::Empty);
    assert_eq!(h.logs().len(), 3);
    assert_eq!(h.transactions().len(), 1);
    assert!(h.queue.inner.is_empty("new-blocks"));
}

#[tokio::test(start_paused = true)]
async fn partial_publish_is_completed_on_redelivery() {
    let h = harness();
    h.store_block(100).await;
    h.announce(PointerMessage::added(hash('a', 100), U256::from(100)))
        .await;

    h.queue.fail_sends_to("transaction-firehose", 1);
    let report = h.drainer.drain(10, MINUTE).await;
    assert!(report.is_failed());
    assert_eq!(h.logs().len(), 3);
    assert!(h.transactions().is_empty());
    assert_eq!(h.queue.inner.len("new-blocks"), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    let report = h.drainer.drain(10, MINUTE).await;
    assert_eq!(report.processed, 1);
    assert_eq!(indices(&h.logs()), vec![(0, false), (1, false), (2, false)]);
    assert_eq!(h.transactions().len(), 1);
}

#[tokio::test]
async fn missing_block_fails_the_message() {
    let h = harness();
    h.announce(PointerMessage::added(hash('a', 100), U256::from(100)))
        .await;

    let report = h.drainer.drain(10, MINUTE).await;
    match report.status {
        DrainStatus::Failed { message_id, reason } => {
            assert!(message_id.is_some());
            assert!(reason.contains("not found"), "{reason}");
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert_eq!(h.queue.inner.len("new-blocks"), 1);
}

#[tokio::test]
async fn stops_at_the_limit_and_on_a_short_budget() {
    let h = harness();
    for n in 100..103 {
        h.store_block(n).await;
        h.announce(PointerMessage::added(hash('a', n), U256::from(n)))
            .await;
    }

    // below min_remaining_budget_ms from the start
    let report = h.drainer.drain(10, Duration::from_millis(100)).await;
    assert_eq!(report.status, DrainStatus::BudgetExhausted);
    assert_eq!(report.processed, 0);

    let report = h.drainer.drain(2, MINUTE).await;
    assert_eq!(report.status, DrainStatus::LimitReached);
    assert_eq!(report.processed, 2);

    let report = h.drainer.drain(10, MINUTE).await;
    assert_eq!(report.status, DrainStatus::Empty);
    assert_eq!(report.processed, 1);
    assert_eq!(h.logs().len(), 9);
}

#[tokio::test(start_paused = true)]
async fn worker_drains_when_woken() {
    let storage = Arc::new(InMemoryStorage::new());
    let queue = Arc::new(InMemoryQueue::new());
    let resolver = Arc::new(AbiResolver::new(
        storage.clone(),
        MockRegistry::new(),
        config().abi_unavailable_ttl_ms(),
    ));
    let drainer = Arc::new(Drainer::new(
        config(),
        storage.clone(),
        queue.clone(),
        resolver,
    ));

    let (block, receipts) = token_block('a', 100, 'a', 1);
    storage
        .put_payload(&BlockPayload { block, receipts }, i64::MAX)
        .await
        .unwrap();
    notify_block(
        queue.as_ref(),
        "new-blocks",
        1,
        &PointerMessage::added(hash('a', 100), U256::from(100)),
        &RetryPolicy::none(),
    )
    .await
    .unwrap();

    let (trigger, wake) = ChannelTrigger::new();
    let (stop, shutdown) = watch::channel(false);
    let worker = tokio::spawn(run_drain_worker(
        drainer,
        wake,
        Duration::from_secs(3600),
        MINUTE,
        shutdown,
    ));

    trigger.trigger().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    stop.send(true).unwrap();

    assert_eq!(worker.await.unwrap(), 1);
    assert_eq!(queue.peek_bodies("log-firehose").len(), 1);
    assert!(queue.receive("new-blocks", 10).await.unwrap().is_empty());
}
