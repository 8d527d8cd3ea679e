//! `chainstream run` and `chainstream tick`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{info, warn};

use chainstream_core::config::StreamConfig;
use chainstream_core::error::StreamError;
use chainstream_core::queue::QueueTransport;
use chainstream_core::state::TickOutcome;
use chainstream_evm::{
    check_network, run_drain_worker, run_reconcile_loop, ChannelTrigger, Drainer, Reconciler,
    RetryPolicy, RetryingTrigger,
};
use chainstream_storage::InMemoryQueue;

use crate::{abi_resolver, chain_client, open_stores, stream_config, GlobalArgs};

/// Upper bound on one drain pass inside `run`.
const DRAIN_BUDGET: Duration = Duration::from_secs(60);
const PRINT_INTERVAL: Duration = Duration::from_millis(200);

pub async fn run(global: &GlobalArgs, budget_secs: Option<u64>) -> Result<()> {
    let config = stream_config(global)?;
    let client = chain_client(global)?;
    check_network(client.as_ref(), config.network_id).await?;
    let stores = open_stores(global, &config).await?;
    let queue = Arc::new(InMemoryQueue::new());
    let resolver = abi_resolver(global, &stores, &config)?;

    let (trigger, wake) = ChannelTrigger::new();
    let reconciler = Reconciler::new(
        config.clone(),
        client,
        stores.pointers.clone(),
        stores.blocks.clone(),
        queue.clone(),
    )
    .with_trigger(Arc::new(RetryingTrigger::new(
        Arc::new(trigger),
        RetryPolicy::default(),
    )));
    let drainer = Arc::new(Drainer::new(
        config.clone(),
        stores.blocks.clone(),
        queue.clone(),
        resolver,
    ));

    let (stop, shutdown) = watch::channel(false);
    let stop = Arc::new(stop);
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, finishing the current tick");
                stop.send_replace(true);
            }
        });
    }

    let idle = Duration::from_millis(config.tick_interval_ms.saturating_mul(5));
    let worker = tokio::spawn(run_drain_worker(
        drainer,
        wake,
        idle,
        DRAIN_BUDGET,
        shutdown.clone(),
    ));
    let printer = tokio::spawn(print_outputs(
        queue.clone(),
        config.clone(),
        shutdown.clone(),
    ));

    let budget = budget_secs.map(Duration::from_secs);
    let summary = run_reconcile_loop(&reconciler, budget, shutdown).await;
    stop.send_replace(true);

    let drained = worker.await?;
    printer.await?;
    forward_all(queue.as_ref(), &config).await?;

    info!(
        ticks = summary.ticks,
        advanced = summary.advanced,
        rewound = summary.rewound,
        drained,
        "stopped"
    );
    if let Some(TickOutcome::Fatal { reason }) = summary.last {
        bail!("reconciler stopped on a fatal condition: {reason}");
    }
    Ok(())
}

pub async fn tick(global: &GlobalArgs) -> Result<()> {
    let config = stream_config(global)?;
    let client = chain_client(global)?;
    check_network(client.as_ref(), config.network_id).await?;
    let stores = open_stores(global, &config).await?;
    let queue = Arc::new(InMemoryQueue::new());

    let reconciler = Reconciler::new(
        config.clone(),
        client,
        stores.pointers,
        stores.blocks,
        queue.clone(),
    );
    let outcome = reconciler.tick().await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    for body in queue.peek_bodies(&config.new_block_queue) {
        print_message(&config.new_block_queue, &body);
    }

    if let TickOutcome::Fatal { reason } = outcome {
        bail!("fatal: {reason}");
    }
    Ok(())
}

// ─── Output ──────────────────────────────────────────────────────────────────

/// One JSON line per downstream message: `{"queue": .., "message": ..}`.
pub fn print_message(queue: &str, body: &str) {
    let message: Value =
        serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()));
    println!("{}", json!({ "queue": queue, "message": message }));
}

/// Consume everything currently in `queue`, printing it.
async fn forward(queue: &InMemoryQueue, name: &str) -> Result<usize, StreamError> {
    let mut printed = 0;
    loop {
        let batch = queue.receive(name, 10).await?;
        if batch.is_empty() {
            return Ok(printed);
        }
        for message in &batch {
            print_message(name, &message.body);
            queue.ack(name, message).await?;
            printed += 1;
        }
    }
}

async fn forward_all(queue: &InMemoryQueue, config: &StreamConfig) -> Result<usize, StreamError> {
    let logs = forward(queue, &config.log_queue).await?;
    let transactions = forward(queue, &config.transaction_queue).await?;
    Ok(logs + transactions)
}

async fn print_outputs(
    queue: Arc<InMemoryQueue>,
    config: StreamConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if let Err(e) = forward_all(queue.as_ref(), &config).await {
            warn!(error = %e, "failed to forward downstream messages");
        }
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(PRINT_INTERVAL) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}
