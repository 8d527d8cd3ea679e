//! `chainstream drain`: replay the fan-out of one stored block.

use std::sync::Arc;

use alloy_primitives::U256;
use anyhow::{anyhow, bail, Result};

use chainstream_core::queue::{PointerMessage, QueueTransport};
use chainstream_evm::{notify_block, Drainer, RetryPolicy};
use chainstream_storage::InMemoryQueue;

use crate::cmd_run::print_message;
use crate::{abi_resolver, open_stores, stream_config, GlobalArgs};

pub async fn run(global: &GlobalArgs, hash: &str, number: U256, removed: bool) -> Result<()> {
    let config = stream_config(global)?;
    let stores = open_stores(global, &config).await?;
    if !stores.blocks.exists(hash, number).await? {
        bail!("block {hash}#{number} is not in the block store");
    }

    let queue = Arc::new(InMemoryQueue::new());
    let resolver = abi_resolver(global, &stores, &config)?;
    let drainer = Drainer::new(config.clone(), stores.blocks.clone(), queue.clone(), resolver);

    let message = if removed {
        PointerMessage::retracted(hash, number)
    } else {
        PointerMessage::added(hash, number)
    };
    notify_block(
        queue.as_ref(),
        &config.new_block_queue,
        config.network_id,
        &message,
        &RetryPolicy::none(),
    )
    .await?;
    let received = queue.receive(&config.new_block_queue, 1).await?;
    let pointer_message = received
        .first()
        .ok_or_else(|| anyhow!("pointer message vanished from the local queue"))?;

    let (logs, transactions) = drainer.process(pointer_message).await?;
    for name in [&config.log_queue, &config.transaction_queue] {
        for body in queue.peek_bodies(name) {
            print_message(name, &body);
        }
    }
    eprintln!("{logs} logs, {transactions} transactions");
    Ok(())
}
