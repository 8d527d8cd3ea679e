//! Long-running drivers for the reconciler and the drain.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{info, warn};

use chainstream_core::error::StreamError;
use chainstream_core::state::{DrainStatus, TickOutcome};

use crate::client::ChainClient;
use crate::drain::Drainer;
use crate::reconciler::Reconciler;

/// Refuse to run against a node of another network.
pub async fn check_network(client: &dyn ChainClient, network_id: u64) -> Result<(), StreamError> {
    let reported = client.net_version().await?;
    let reported_id: u64 = reported.trim().parse().map_err(|_| {
        StreamError::Rpc(format!("net_version returned a non-numeric id: {reported}"))
    })?;
    if reported_id != network_id {
        return Err(StreamError::Config(format!(
            "node serves network {reported_id}, configured for {network_id}"
        )));
    }
    match client.client_version().await {
        Ok(version) => info!(network_id, client_version = %version, "connected to node"),
        Err(e) => warn!(network_id, error = %e, "could not read client version"),
    }
    Ok(())
}

/// Totals of one [`run_reconcile_loop`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopSummary {
    pub ticks: u64,
    pub advanced: u64,
    pub rewound: u64,
    pub aborted: u64,
    pub last: Option<TickOutcome>,
}

/// Issue ticks until the budget is nearly spent, a tick is fatal, or
/// `shutdown` flips to `true` (or its sender is dropped).
///
/// After a tick that moved the pointer the next one starts right away, so a
/// reconciler that is behind catches up; otherwise it waits
/// `tick_interval_ms`. `budget = None` runs until shutdown.
pub async fn run_reconcile_loop(
    reconciler: &Reconciler,
    budget: Option<Duration>,
    mut shutdown: watch::Receiver<bool>,
) -> LoopSummary {
    let config = reconciler.config();
    let started = Instant::now();
    let min_remaining = Duration::from_millis(config.min_remaining_budget_ms);
    let interval = Duration::from_millis(config.tick_interval_ms);
    let mut summary = LoopSummary::default();

    loop {
        if *shutdown.borrow() {
            break;
        }
        if let Some(budget) = budget {
            if budget.saturating_sub(started.elapsed()) < min_remaining {
                break;
            }
        }

        let outcome = reconciler.tick().await;
        summary.ticks += 1;
        match &outcome {
            TickOutcome::Advanced { .. } => summary.advanced += 1,
            TickOutcome::Rewound { .. } => summary.rewound += 1,
            TickOutcome::Aborted { .. } => summary.aborted += 1,
            TickOutcome::UpToDate { .. } | TickOutcome::Fatal { .. } => {}
        }
        let fatal = outcome.is_fatal();
        let progressed = outcome.made_progress();
        summary.last = Some(outcome);
        if fatal {
            break;
        }
        if progressed {
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(
        network_id = config.network_id,
        ticks = summary.ticks,
        advanced = summary.advanced,
        rewound = summary.rewound,
        aborted = summary.aborted,
        "reconcile loop stopped"
    );
    summary
}

/// Drain whenever woken through `wake` and at least every `idle_interval`.
///
/// Each wake-up drains until the queue is empty or a message fails. Returns
/// the number of pointer messages processed once `shutdown` flips or every
/// trigger is gone.
pub async fn run_drain_worker(
    drainer: Arc<Drainer>,
    mut wake: mpsc::Receiver<()>,
    idle_interval: Duration,
    budget: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> usize {
    let mut processed = 0;
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            woken = wake.recv() => {
                if woken.is_none() {
                    break;
                }
            }
            _ = tokio::time::sleep(idle_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        loop {
            let report = drainer.drain(usize::MAX, budget).await;
            processed += report.processed;
            match report.status {
                DrainStatus::LimitReached | DrainStatus::BudgetExhausted => continue,
                DrainStatus::Empty | DrainStatus::Failed { .. } => break,
            }
        }
    }
    info!(processed, "drain worker stopped");
    processed
}
