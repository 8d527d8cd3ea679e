mod common;

use std::sync::Arc;

use alloy_primitives::U256;
use async_trait::async_trait;
use tokio::sync::watch;

use chainstream_core::block::BlockStore;
use chainstream_core::config::StreamConfig;
use chainstream_core::error::StreamError;
use chainstream_core::pointer::{ChainPointer, PointerStore};
use chainstream_core::queue::PointerMessage;
use chainstream_core::state::{ReconcileState, TickOutcome};
use chainstream_evm::{
    check_network, decode_pointer_message, run_reconcile_loop, ChannelTrigger, Reconciler,
    RetryPolicy, StreamConfigBuilder,
};
use chainstream_storage::{InMemoryQueue, InMemoryStorage};

use common::{empty_block, hash, token_block, MockChain};

fn config() -> StreamConfig {
    StreamConfigBuilder::new()
        .network_id(1)
        .rewind_block_lookback(2)
        .history_depth(8)
        .build()
        .unwrap()
}

struct Harness {
    chain: Arc<MockChain>,
    storage: Arc<InMemoryStorage>,
    queue: Arc<InMemoryQueue>,
    reconciler: Reconciler,
}

fn harness() -> Harness {
    let chain = MockChain::new(1);
    let storage = Arc::new(InMemoryStorage::new());
    let queue = Arc::new(InMemoryQueue::new());
    let reconciler = Reconciler::new(
        config(),
        chain.clone(),
        storage.clone(),
        storage.clone(),
        queue.clone(),
    )
    .with_retry(RetryPolicy::none());
    Harness {
        chain,
        storage,
        queue,
        reconciler,
    }
}

fn pointer_messages(queue: &InMemoryQueue) -> Vec<PointerMessage> {
    queue
        .peek_bodies("new-blocks")
        .iter()
        .map(|b| decode_pointer_message(b).unwrap())
        .collect()
}

fn advanced_to(tag: char, n: u64) -> TickOutcome {
    TickOutcome::Advanced {
        block_number: U256::from(n),
        block_hash: hash(tag, n),
    }
}

#[tokio::test]
async fn advances_rewinds_and_follows_the_new_fork() {
    let h = harness();
    h.chain.extend('a', 100, 101);
    h.chain.set_head(102);

    // no pointer yet: start `lookback` blocks behind the head
    assert_eq!(h.reconciler.tick().await, advanced_to('a', 100));
    let p = h.reconciler.pointer().await.unwrap().unwrap();
    assert_eq!(p.sequence_index, 0);
    assert!(p.history.is_empty());

    assert_eq!(h.reconciler.tick().await, advanced_to('a', 101));

    // 101 is reorged out: the node now serves 101' and 102' on top of 100
    h.chain.insert(empty_block('f', 101, 'a'), vec![]);
    h.chain.insert(empty_block('f', 102, 'f'), vec![]);

    let outcome = h.reconciler.tick().await;
    assert_eq!(
        outcome,
        TickOutcome::Rewound {
            retracted_number: U256::from(101),
            retracted_hash: hash('a', 101),
            block_number: U256::from(100),
            block_hash: hash('a', 100),
        }
    );
    let p = h.reconciler.pointer().await.unwrap().unwrap();
    assert_eq!(p.block_hash, hash('a', 100));
    assert_eq!(p.sequence_index, 2);
    assert_eq!(p.consecutive_rewinds(), 1);

    assert_eq!(h.reconciler.tick().await, advanced_to('f', 101));
    assert_eq!(h.reconciler.tick().await, advanced_to('f', 102));
    assert!(matches!(
        h.reconciler.tick().await,
        TickOutcome::UpToDate { .. }
    ));

    let p = h.reconciler.pointer().await.unwrap().unwrap();
    assert_eq!(p.sequence_index, 4);
    assert_eq!(p.history.len(), 4);
    assert_eq!(p.history[0].block_hash, hash('f', 101));

    let messages = pointer_messages(&h.queue);
    assert_eq!(
        messages,
        vec![
            PointerMessage::added(hash('a', 100), U256::from(100)),
            PointerMessage::added(hash('a', 101), U256::from(101)),
            PointerMessage::retracted(hash('a', 101), U256::from(101)),
            PointerMessage::added(hash('f', 101), U256::from(101)),
            PointerMessage::added(hash('f', 102), U256::from(102)),
        ]
    );
    assert_eq!(messages[2].dedup_key(), format!("{}-0x65-true", hash('a', 101)));

    // both forks of 101 stay stored
    assert_eq!(h.storage.blocks_at(U256::from(101)).await.unwrap().len(), 2);
}

#[tokio::test]
async fn stops_once_the_rewind_streak_exceeds_the_lookback() {
    let h = harness();
    h.chain.extend('a', 100, 105);
    h.chain.set_head(102);
    for _ in 0..3 {
        assert!(h.reconciler.tick().await.made_progress());
    }
    h.chain.set_head(105);
    for _ in 0..3 {
        assert!(h.reconciler.tick().await.made_progress());
    }
    let p = h.reconciler.pointer().await.unwrap().unwrap();
    assert_eq!(p.block_hash, hash('a', 105));

    // a reorg from 102 upwards is deeper than the lookback of 2
    h.chain.insert(empty_block('f', 102, 'a'), vec![]);
    h.chain.extend('f', 103, 106);
    h.chain.set_head(106);

    let (_stop, shutdown) = watch::channel(false);
    let summary = run_reconcile_loop(&h.reconciler, None, shutdown).await;
    assert_eq!(summary.rewound, 3);
    assert_eq!(summary.advanced, 0);
    assert!(summary.last.as_ref().unwrap().is_fatal());

    let p = h.reconciler.pointer().await.unwrap().unwrap();
    assert_eq!(p.block_hash, hash('a', 102));
    assert_eq!(p.consecutive_rewinds(), 3);

    // stays fatal until an operator intervenes
    assert!(h.reconciler.tick().await.is_fatal());
    let retractions = pointer_messages(&h.queue)
        .into_iter()
        .filter(|m| m.removed)
        .count();
    assert_eq!(retractions, 3);
}

#[tokio::test]
async fn rewind_without_the_stored_block_aborts_and_changes_nothing() {
    let h = harness();
    h.chain.extend('a', 100, 101);
    h.chain.set_head(102);
    assert_eq!(h.reconciler.tick().await, advanced_to('a', 100));
    assert_eq!(h.reconciler.tick().await, advanced_to('a', 101));
    let before = h.reconciler.pointer().await.unwrap().unwrap();
    let messages_before = pointer_messages(&h.queue);

    // block records expired, then 102 arrives on another fork
    assert_eq!(h.storage.purge_expired(i64::MAX).unwrap(), 2);
    h.chain.insert(empty_block('f', 102, 'f'), vec![]);

    let outcome = h.reconciler.tick().await;
    match &outcome {
        TickOutcome::Aborted { stage, reason } => {
            assert_eq!(*stage, ReconcileState::Rewinding);
            assert!(reason.contains("not stored"), "{reason}");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(!outcome.made_progress());

    assert_eq!(h.reconciler.pointer().await.unwrap().unwrap(), before);
    assert_eq!(pointer_messages(&h.queue), messages_before);
    assert_eq!(h.storage.block_count(), 0);
}

#[tokio::test]
async fn inconsistent_receipts_abort_before_anything_is_stored() {
    let h = harness();
    let (block, mut receipts) = token_block('a', 100, 'a', 2);
    receipts[0].logs[1].block_hash = hash('b', 100);
    h.chain.insert(block, receipts);
    h.chain.set_head(102);

    let outcome = h.reconciler.tick().await;
    assert!(matches!(
        outcome,
        TickOutcome::Aborted {
            stage: ReconcileState::Validating,
            ..
        }
    ));
    assert_eq!(h.storage.block_count(), 0);
    assert!(h.reconciler.pointer().await.unwrap().is_none());
    assert!(h.queue.is_empty("new-blocks"));
}

#[tokio::test]
async fn missing_block_aborts_the_fetch() {
    let h = harness();
    h.chain.set_head(102);
    assert!(matches!(
        h.reconciler.tick().await,
        TickOutcome::Aborted {
            stage: ReconcileState::Fetching,
            ..
        }
    ));
}

/// Lets another writer move the pointer right before the first write.
struct RacingPointers {
    inner: Arc<InMemoryStorage>,
    raced: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl PointerStore for RacingPointers {
    async fn get_pointer(&self, network_id: u64) -> Result<Option<ChainPointer>, StreamError> {
        self.inner.get_pointer(network_id).await
    }

    async fn put_pointer(
        &self,
        previous: Option<&ChainPointer>,
        next: &ChainPointer,
    ) -> Result<(), StreamError> {
        if !self.raced.swap(true, std::sync::atomic::Ordering::SeqCst) {
            let rival = ChainPointer::first(next.network_id, "0xrival", U256::from(7), 0);
            self.inner.put_pointer(None, &rival).await?;
        }
        self.inner.put_pointer(previous, next).await
    }

    async fn delete_pointer(&self, network_id: u64) -> Result<(), StreamError> {
        self.inner.delete_pointer(network_id).await
    }
}

#[tokio::test]
async fn lost_compare_and_swap_aborts_the_advance() {
    let chain = MockChain::new(1);
    chain.extend('a', 100, 100);
    chain.set_head(102);
    let storage = Arc::new(InMemoryStorage::new());
    let pointers = Arc::new(RacingPointers {
        inner: storage.clone(),
        raced: Default::default(),
    });
    let reconciler = Reconciler::new(
        config(),
        chain,
        pointers,
        storage.clone(),
        Arc::new(InMemoryQueue::new()),
    )
    .with_retry(RetryPolicy::none());

    assert!(matches!(
        reconciler.tick().await,
        TickOutcome::Aborted {
            stage: ReconcileState::Advancing,
            ..
        }
    ));
    // the persisted block is harmless; the rival pointer wins
    assert_eq!(storage.block_count(), 1);
    let p = storage.get_pointer(1).await.unwrap().unwrap();
    assert_eq!(p.block_hash, "0xrival");
}

#[tokio::test]
async fn progress_wakes_the_drain() {
    let chain = MockChain::new(1);
    chain.extend('a', 100, 100);
    chain.set_head(102);
    let storage = Arc::new(InMemoryStorage::new());
    let (trigger, mut wake) = ChannelTrigger::new();
    let reconciler = Reconciler::new(
        config(),
        chain,
        storage.clone(),
        storage,
        Arc::new(InMemoryQueue::new()),
    )
    .with_trigger(Arc::new(trigger))
    .with_retry(RetryPolicy::none());

    assert!(reconciler.tick().await.made_progress());
    assert!(wake.try_recv().is_ok());

    // node has nothing new at 101
    assert!(!reconciler.tick().await.made_progress());
    assert!(wake.try_recv().is_err());
}

#[tokio::test]
async fn network_mismatch_is_refused() {
    let chain = MockChain::new(5);
    check_network(chain.as_ref(), 5).await.unwrap();
    let err = check_network(chain.as_ref(), 1).await.unwrap_err();
    assert!(matches!(err, StreamError::Config(_)));
}
