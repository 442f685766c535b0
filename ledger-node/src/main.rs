//! Ledger Node - validator and block producer

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ledger_consensus::config::{Allocation, ConsensusKind};
use ledger_consensus::network::NullNetwork;
use ledger_consensus::{ConsensusEngine, NetService, NetworkMessage, NoopExecutor, NodeConfig};
use ledger_core::{FileStorage, KeyPair, MemoryStorage, Signer, Storage};
use rand::RngCore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "ledger-node", about = "Ledger Node - validate and produce blocks", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (TOML, or JSON by extension)
    #[arg(short, long, default_value = "ledger-node.toml")]
    config: PathBuf,

    /// Directory holding chain data; kept in memory when omitted
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a single-producer configuration with a fresh key
    Init {
        /// Consensus to configure: pow or dpos
        #[arg(long, default_value = "dpos")]
        consensus: String,

        /// Amount allocated to the new key in the genesis block
        #[arg(long, default_value = "1000000")]
        allocation: String,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },
    /// Run the node until interrupted
    Start,
    /// Validate the configuration and print the genesis block
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "ledger_node={},ledger_consensus={},ledger_core={}",
            log_level, log_level, log_level
        ))
        .init();

    let result = match cli.command {
        Commands::Init {
            consensus,
            allocation,
            force,
        } => handle_init(&cli.config, &consensus, allocation, force),
        Commands::Start => handle_start(&cli.config, cli.data_dir.as_deref()).await,
        Commands::Check => handle_check(&cli.config, cli.data_dir.as_deref()),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn handle_init(path: &Path, consensus: &str, allocation: String, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists, pass --force to overwrite", path.display());
    }

    let kind = match consensus {
        "pow" => ConsensusKind::Pow,
        "dpos" => ConsensusKind::Dpos,
        other => anyhow::bail!("Unknown consensus {}, expected pow or dpos", other),
    };

    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    let config = single_producer_config(kind, &seed, allocation)?;
    let owner = KeyPair::from_seed(&seed).owner();

    config
        .save_to_file(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    info!("✅ Node configuration written to {}", path.display());
    info!("Producer: {}", owner);
    warn!("The configuration file holds the private key, keep it safe");
    Ok(())
}

fn single_producer_config(kind: ConsensusKind, seed: &[u8; 32], allocation: String) -> Result<NodeConfig> {
    let owner = KeyPair::from_seed(seed).owner();
    let mut config = NodeConfig::default();
    config.consensus.kind = kind;
    config.consensus.max_producers = 1;
    config.consensus.producers = vec![owner.to_string()];
    config.producer.private_key = Some(hex::encode(seed));
    config.genesis.allocations = vec![Allocation {
        owner: owner.to_string(),
        amount: allocation,
    }];
    config.validate().context("Generated configuration is invalid")?;
    Ok(config)
}

fn load_config(path: &Path) -> Result<NodeConfig> {
    NodeConfig::from_file(path).with_context(|| format!("Failed to load configuration {}", path.display()))
}

fn handle_check(path: &Path, data_dir: Option<&Path>) -> Result<()> {
    let config = load_config(path)?;
    let engine = build_engine(&config, open_storage(data_dir)?, Arc::new(NullNetwork))?;
    let genesis = engine.block_by_height(0).context("Chain has no genesis block")?;

    println!("Configuration OK");
    println!("  consensus: {:?}", config.consensus.kind);
    println!("  producing: {}", config.producer.private_key.is_some());
    println!("  genesis:   {}", hex::encode(genesis.hash()));
    println!("  height:    {}", engine.tail_height());
    Ok(())
}

async fn handle_start(path: &Path, data_dir: Option<&Path>) -> Result<()> {
    let config = load_config(path)?;

    let (outbox, mut outgoing) = mpsc::unbounded_channel::<NetworkMessage>();
    let engine = Arc::new(build_engine(&config, open_storage(data_dir)?, Arc::new(outbox))?);

    info!("Starting node with {:?} consensus", config.consensus.kind);
    info!("Tail height: {}", engine.tail_height());

    // No transport is attached; outgoing traffic is only logged.
    tokio::spawn(async move {
        while let Some(message) = outgoing.recv().await {
            match message {
                NetworkMessage::NewBlock(block) => {
                    info!("Broadcast block {} at height {}", hex::encode(block.hash()), block.height())
                }
                other => tracing::debug!("Outgoing message: {:?}", other),
            }
        }
    });

    let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let driver = tokio::spawn(engine.clone().run(inbound_rx, shutdown_rx));

    info!("🎯 Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    info!("🛑 Shutting down node...");

    let _ = shutdown_tx.send(());
    driver.await.context("Consensus driver panicked")?;

    let lib = engine.last_irreversible_block();
    info!("Stopped at height {}, irreversible height {}", engine.tail_height(), lib.height());
    Ok(())
}

fn open_storage(data_dir: Option<&Path>) -> Result<Arc<dyn Storage>> {
    match data_dir {
        Some(dir) => {
            let store = FileStorage::open(dir)
                .with_context(|| format!("Failed to open data directory {}", dir.display()))?;
            info!("Chain data directory: {}", dir.display());
            Ok(Arc::new(store))
        }
        None => {
            warn!("No --data-dir given, chain data will not survive a restart");
            Ok(Arc::new(MemoryStorage::new()))
        }
    }
}

fn build_engine(
    config: &NodeConfig,
    store: Arc<dyn Storage>,
    network: Arc<dyn NetService>,
) -> Result<ConsensusEngine> {
    ConsensusEngine::from_config(config, store, network, Arc::new(NoopExecutor))
        .context("Failed to build consensus engine")
}
