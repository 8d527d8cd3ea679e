//! ChainStream CLI: stream reconciled blocks, decoded logs and transactions.
//!
//! # Commands
//! ```text
//! chainstream run     --rpc-url <url> [--db <file>] [--budget-secs <n>]
//! chainstream tick    --rpc-url <url> [--db <file>]
//! chainstream drain   --hash <0x..> --number <n> [--removed] --db <file>
//! chainstream status  [--db <file>]
//! chainstream reset   --yes [--db <file>]
//! chainstream info
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::U256;
use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use chainstream_abi::{AbiResolver, EtherscanRegistry};
use chainstream_core::abi::AbiStore;
use chainstream_core::block::BlockStore;
use chainstream_core::config::StreamConfig;
use chainstream_core::pointer::PointerStore;
use chainstream_evm::{HttpChainClient, HttpClientConfig, StreamConfigBuilder};
use chainstream_storage::sqlite::SqliteStorage;
use chainstream_storage::InMemoryStorage;

mod cmd_drain;
mod cmd_run;
mod logging;

use logging::{init_tracing, LogConfig};

#[derive(Parser)]
#[command(
    name = "chainstream",
    about = "Reorg-safe EVM block, log and transaction stream",
    long_about = "
ChainStream follows an EVM chain one block at a time, persists every reconciled
block, and fans each one out as decoded logs and transactions. Reorgs are
repaired by retracting blocks one at a time.

ENVIRONMENT VARIABLES:
  CHAINSTREAM_RPC_URL         JSON-RPC endpoint of the node
  CHAINSTREAM_DB              SQLite database file (memory when unset)
  CHAINSTREAM_NETWORK_ID      Network id the node must report
  CHAINSTREAM_ETHERSCAN_KEY   Etherscan API key for ABI lookups
",
    version
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// JSON-RPC endpoint of the node
    #[arg(long, env = "CHAINSTREAM_RPC_URL", global = true)]
    rpc_url: Option<String>,

    /// SQLite database file; in-memory storage when omitted
    #[arg(long, env = "CHAINSTREAM_DB", global = true)]
    db: Option<String>,

    /// Network id the node must report through net_version
    #[arg(long, env = "CHAINSTREAM_NETWORK_ID", default_value_t = 1, global = true)]
    network_id: u64,

    /// Blocks to stay behind the head
    #[arg(long, env = "CHAINSTREAM_NUM_BLOCKS_DELAY", default_value_t = 0, global = true)]
    num_blocks_delay: u64,

    /// Start margin and maximum rewind streak
    #[arg(long, env = "CHAINSTREAM_REWIND_BLOCK_LOOKBACK", default_value_t = 10, global = true)]
    rewind_block_lookback: u64,

    /// Pointer history entries kept
    #[arg(long, env = "CHAINSTREAM_HISTORY_DEPTH", default_value_t = 32, global = true)]
    history_depth: usize,

    /// Reconcile cadence in milliseconds
    #[arg(long, env = "CHAINSTREAM_TICK_INTERVAL_MS", default_value_t = 1_000, global = true)]
    tick_interval_ms: u64,

    /// Largest payload chunk stored per SQLite row
    #[arg(
        long,
        env = "CHAINSTREAM_MAX_BLOCK_CHUNK_BYTES",
        default_value_t = 350 * 1024,
        global = true
    )]
    max_block_chunk_bytes: usize,

    /// Etherscan-compatible API endpoint
    #[arg(
        long,
        env = "CHAINSTREAM_ETHERSCAN_URL",
        default_value = EtherscanRegistry::DEFAULT_API_URL,
        global = true
    )]
    etherscan_url: String,

    /// Etherscan API key
    #[arg(long, env = "CHAINSTREAM_ETHERSCAN_KEY", hide_env_values = true, global = true)]
    etherscan_key: Option<String>,

    /// Default log level
    #[arg(long, env = "CHAINSTREAM_LOG", default_value = "info", global = true)]
    log_level: String,

    /// Per-crate log level, e.g. `chainstream-evm=debug` (repeatable)
    #[arg(long = "log-component", value_name = "CRATE=LEVEL", global = true)]
    log_components: Vec<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "CHAINSTREAM_LOG_JSON", global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile and drain continuously, printing downstream messages as JSON lines
    Run {
        /// Stop after this many seconds (runs until Ctrl-C when omitted)
        #[arg(long)]
        budget_secs: Option<u64>,
    },

    /// Run a single reconciliation tick and print its outcome
    Tick,

    /// Fan out one stored block and print the messages it produces
    Drain {
        /// Block hash (0x-prefixed)
        #[arg(long)]
        hash: String,
        /// Block number
        #[arg(long)]
        number: u64,
        /// Publish as a retraction
        #[arg(long)]
        removed: bool,
    },

    /// Print the chain pointer
    Status,

    /// Delete the chain pointer so the next tick starts fresh
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },

    /// Show defaults and supported backends
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&log_config(&cli.global)?);

    match cli.command {
        Commands::Run { budget_secs } => cmd_run::run(&cli.global, budget_secs).await,
        Commands::Tick => cmd_run::tick(&cli.global).await,
        Commands::Drain {
            hash,
            number,
            removed,
        } => cmd_drain::run(&cli.global, &hash, U256::from(number), removed).await,
        Commands::Status => cmd_status(&cli.global).await,
        Commands::Reset { yes } => cmd_reset(&cli.global, yes).await,
        Commands::Info => cmd_info(),
    }
}

// ─── Wiring ──────────────────────────────────────────────────────────────────

fn log_config(global: &GlobalArgs) -> Result<LogConfig> {
    let mut components = HashMap::new();
    for entry in &global.log_components {
        let (component, level) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("--log-component expects CRATE=LEVEL, got '{entry}'"))?;
        components.insert(component.to_string(), level.to_string());
    }
    Ok(LogConfig {
        level: global.log_level.clone(),
        components,
        json: global.log_json,
    })
}

fn stream_config(global: &GlobalArgs) -> Result<StreamConfig> {
    StreamConfigBuilder::new()
        .network_id(global.network_id)
        .num_blocks_delay(global.num_blocks_delay)
        .rewind_block_lookback(global.rewind_block_lookback)
        .history_depth(global.history_depth)
        .tick_interval_ms(global.tick_interval_ms)
        .max_block_chunk_bytes(global.max_block_chunk_bytes)
        .build()
        .context("invalid stream configuration")
}

/// The three stores, all backed by one storage instance.
struct Stores {
    pointers: Arc<dyn PointerStore>,
    blocks: Arc<dyn BlockStore>,
    abis: Arc<dyn AbiStore>,
}

async fn open_sqlite(path: &str, config: &StreamConfig) -> Result<SqliteStorage> {
    let storage = SqliteStorage::open(path)
        .await
        .with_context(|| format!("cannot open database '{path}'"))?;
    Ok(storage.with_chunk_bytes(config.max_block_chunk_bytes))
}

async fn open_stores(global: &GlobalArgs, config: &StreamConfig) -> Result<Stores> {
    match global.db.as_deref() {
        Some(path) => {
            let storage = Arc::new(open_sqlite(path, config).await?);
            Ok(Stores {
                pointers: storage.clone(),
                blocks: storage.clone(),
                abis: storage,
            })
        }
        None => {
            tracing::warn!("no --db given, state lives in memory and is lost on exit");
            let storage = Arc::new(InMemoryStorage::new());
            Ok(Stores {
                pointers: storage.clone(),
                blocks: storage.clone(),
                abis: storage,
            })
        }
    }
}

fn chain_client(global: &GlobalArgs) -> Result<Arc<HttpChainClient>> {
    let url = global
        .rpc_url
        .as_deref()
        .ok_or_else(|| anyhow!("--rpc-url (or CHAINSTREAM_RPC_URL) is required"))?;
    Ok(Arc::new(HttpChainClient::new(url, HttpClientConfig::default())?))
}

fn abi_resolver(global: &GlobalArgs, stores: &Stores, config: &StreamConfig) -> Result<Arc<AbiResolver>> {
    let registry = EtherscanRegistry::new(global.etherscan_url.clone(), global.etherscan_key.clone())
        .context("cannot build the ABI registry client")?;
    Ok(Arc::new(AbiResolver::new(
        stores.abis.clone(),
        Arc::new(registry),
        config.abi_unavailable_ttl_ms(),
    )))
}

// ─── Inspection commands ─────────────────────────────────────────────────────

async fn cmd_status(global: &GlobalArgs) -> Result<()> {
    let stores = open_stores(global, &stream_config(global)?).await?;
    match stores.pointers.get_pointer(global.network_id).await? {
        Some(pointer) => {
            println!("{}", serde_json::to_string_pretty(&pointer)?);
            let streak = pointer.consecutive_rewinds();
            if streak > 0 {
                eprintln!("rewind streak: {streak} of {} allowed", global.rewind_block_lookback);
            }
        }
        None => println!("no chain pointer for network {}", global.network_id),
    }
    Ok(())
}

async fn cmd_reset(global: &GlobalArgs, yes: bool) -> Result<()> {
    if !yes {
        bail!("refusing to delete the chain pointer without --yes");
    }
    let stores = open_stores(global, &stream_config(global)?).await?;
    stores.pointers.delete_pointer(global.network_id).await?;
    println!("chain pointer for network {} deleted", global.network_id);
    Ok(())
}

fn cmd_info() -> Result<()> {
    let defaults = StreamConfig::default();
    println!("ChainStream v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default network id:       {}", defaults.network_id);
    println!("  Default rewind lookback:  {} blocks", defaults.rewind_block_lookback);
    println!("  Default history depth:    {}", defaults.history_depth);
    println!("  Default block TTL:        {} ms", defaults.block_data_ttl_ms);
    println!("  Default negative ABI TTL: {} s", defaults.abi_unavailable_ttl_secs);
    println!("  Default chunk size:       {} bytes", defaults.max_block_chunk_bytes);
    println!(
        "  Queues:                   {} → {}, {}",
        defaults.new_block_queue, defaults.log_queue, defaults.transaction_queue
    );
    println!("  Storage backends:         memory, SQLite (--db)");
    println!("  ABI registry:             {}", EtherscanRegistry::DEFAULT_API_URL);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainstream_core::types::{Block, BlockPayload, BlockTransactions};

    #[tokio::test]
    async fn chunk_size_flag_reaches_the_sqlite_store() {
        let path = std::env::temp_dir().join(format!("chainstream-cli-{}.db", std::process::id()));
        let path = path.to_string_lossy().into_owned();
        let cli = Cli::try_parse_from([
            "chainstream",
            "--db",
            &path,
            "--max-block-chunk-bytes",
            "16",
            "status",
        ])
        .unwrap();
        let config = stream_config(&cli.global).unwrap();
        assert_eq!(config.max_block_chunk_bytes, 16);

        let storage = open_sqlite(&path, &config).await.unwrap();
        let payload = BlockPayload {
            block: Block {
                hash: format!("0x{:064x}", 1),
                number: U256::from(1),
                parent_hash: format!("0x{:064x}", 0),
                timestamp: U256::ZERO,
                transactions: BlockTransactions::Hashes(
                    (0..20).map(|i| format!("0x{i:064x}")).collect(),
                ),
                extra: Default::default(),
            },
            receipts: vec![],
        };
        storage.put_payload(&payload, i64::MAX).await.unwrap();
        let rows = storage.chunk_count(&payload.block.hash, U256::from(1)).await.unwrap();
        assert!(rows > 1, "{rows} chunk rows");

        drop(storage);
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{path}{suffix}"));
        }
    }
}
