// SPDX-License-Identifier: MIT

//! `peerpool` bootstraps a pool of Bitcoin peers and asks them things: block lists, headers,
//! blocks, transactions, mempool contents or more addresses. With `--consensus`, an answer is
//! only printed if several peers sent exactly the same one.

// Coding conventions (lexicographically sorted)
#![deny(arithmetic_overflow)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(non_upper_case_globals)]

mod cli;
mod config_file;
mod error;

use std::io;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::consensus::encode::serialize_hex;
use bitcoin::Network;
use clap::Parser;
use cli::Cli;
use cli::Commands;
use config_file::ConfigFile;
use error::CliError;
use peerpool_common::Hash256;
use peerpool_wire::discovery::DnsSeedDiscovery;
use peerpool_wire::discovery::PeerDiscovery;
use peerpool_wire::discovery::StaticDiscovery;
use peerpool_wire::random::ThreadRandom;
use peerpool_wire::transport::TcpConnector;
use peerpool_wire::PeerAddress;
use peerpool_wire::Pool;
use peerpool_wire::PoolConfig;
use peerpool_wire::WireError;
use tokio::time::sleep;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// How long we wait for enough peers to show up before a consensus query
const CONSENSUS_WAIT: Duration = Duration::from_secs(30);

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("peerpool")
        .build()?;

    runtime.block_on(run(cli))?;
    Ok(())
}

/// Set up the logger for `peerpool`.
///
/// Events from `tracing` and records from the `log` facade, which is what the library crates
/// use, are filtered by `RUST_LOG`, or by `--debug` if it isn't set, and printed to stderr, so
/// they don't get mixed with command output.
fn init_logging(debug: bool) -> anyhow::Result<()> {
    let log_level = if debug { "debug" } else { "info" };
    let log_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let log_timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string());
    let fmt_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(IsTerminal::is_terminal(&io::stderr()))
        .with_timer(log_timer)
        .with_target(true)
        .with_level(true);

    // With the `tracing-log` feature this also forwards `log` records
    tracing_subscriber::registry()
        .with(log_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

/// The config file the user asked for, or the default one if it exists
fn load_config_file(path: Option<&str>) -> Result<ConfigFile, CliError> {
    if let Some(path) = path {
        return ConfigFile::from_file(path);
    }

    let default_path: PathBuf = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".peerpool")
        .join("config.toml");

    if !default_path.exists() {
        debug!("No config file at {default_path:?}, using defaults");
        return Ok(ConfigFile::default());
    }

    ConfigFile::from_file(&default_path.to_string_lossy())
}

fn parse_peers(peers: &[String], default_port: u16) -> Result<Vec<PeerAddress>, CliError> {
    peers
        .iter()
        .map(|peer| {
            PeerAddress::parse(peer, default_port)
                .map_err(|e| CliError::InvalidPeer(peer.clone(), e))
        })
        .collect()
}

fn build_config(cli: &Cli, file: &ConfigFile) -> PoolConfig {
    let mut config = PoolConfig::new(cli.network);
    file.apply(&mut config);

    if let Some(max_size) = cli.max_size {
        config.max_size = max_size;
    }
    if let Some(consensus_size) = cli.consensus_size {
        config.consensus_size = consensus_size;
    }

    config
}

/// Without a locator we start right after genesis
fn locator_or_genesis(locator: Vec<Hash256>, network: Network) -> Vec<Hash256> {
    if !locator.is_empty() {
        return locator;
    }

    vec![bitcoin::constants::genesis_block(network).block_hash().into()]
}

/// Connections keep coming up in the background after bootstrap, give them some time
async fn wait_for_clients(pool: &Pool, amount: usize) -> Result<(), WireError> {
    let deadline = Instant::now() + CONSENSUS_WAIT;
    while pool.clients()?.len() < amount && Instant::now() < deadline {
        sleep(Duration::from_millis(250)).await;
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let file = load_config_file(cli.config_file.as_deref())?;
    let config = build_config(&cli, &file);

    let peers = if cli.connect.is_empty() {
        file.pool.peers.clone().unwrap_or_default()
    } else {
        cli.connect.clone()
    };
    let peers = parse_peers(&peers, config.default_port)?;

    let random = Arc::new(ThreadRandom);
    let discovery: Arc<dyn PeerDiscovery> = if peers.is_empty() {
        Arc::new(DnsSeedDiscovery::new(cli.network, random.clone()))
    } else {
        info!("Using {} peers given by the user, skipping DNS seeds", peers.len());
        Arc::new(StaticDiscovery::new(peers))
    };

    let consensus_size = config.consensus_size;
    let pool = Pool::new(config, Arc::new(TcpConnector), discovery, random);
    pool.bootstrap().await?;

    if cli.consensus {
        wait_for_clients(&pool, consensus_size).await?;
    }

    let result = run_command(&pool, &cli).await;
    pool.disconnect()?;
    result
}

async fn run_command(pool: &Pool, cli: &Cli) -> Result<(), CliError> {
    match cli.command.clone() {
        Commands::GetBlocks { locator } => {
            let locator = locator_or_genesis(locator, cli.network);
            let inventory = if cli.consensus {
                pool.get_block_list_with_consensus(&locator).await?
            } else {
                pool.get_block_list(&locator).await?
            };

            for item in inventory {
                println!("{item:?}");
            }
        }
        Commands::GetHeaders { locator } => {
            let locator = locator_or_genesis(locator, cli.network);
            let headers = if cli.consensus {
                pool.get_headers_with_consensus(&locator).await?
            } else {
                pool.get_headers(&locator).await?
            };

            for header in headers {
                println!("{} {}", header.block_hash(), header.time);
            }
        }
        Commands::GetBlock { hashes } => {
            let blocks = pool.get_blocks(&hashes).await?;
            for (hash, block) in hashes.iter().zip(blocks) {
                match block {
                    Some(block) => println!("{}", serialize_hex(&block)),
                    None => println!("Block {hash} not found"),
                }
            }
        }
        Commands::GetTransaction { txids } => {
            let transactions = pool.get_transactions(&txids).await?;
            for (txid, tx) in txids.iter().zip(transactions) {
                match tx {
                    Some(tx) => println!("{}", serialize_hex(&tx)),
                    None => println!("Transaction {txid} not found"),
                }
            }
        }
        Commands::Mempool => {
            for item in pool.get_mem_pool().await? {
                println!("{item:?}");
            }
        }
        Commands::GetPeers => {
            for peer in pool.get_peers().await {
                println!("{peer}");
            }
        }
        Commands::Status => {
            println!("connections: {}", pool.len()?);
            for client in pool.clients()? {
                println!("ready: {}", client.address());
            }
        }
    }

    Ok(())
}
