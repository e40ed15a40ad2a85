//! agent-rpc command line
//!
//! Operator view of the RPC layer: endpoint health, chain head, balances,
//! transaction status and the Prometheus exposition of the client metrics.

use alloy_primitives::{Address, B256};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use agent_rpc::config::LoggingConfig;
use agent_rpc::{AppConfig, RpcManager, RpcTelemetry, TransactionManager};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "agent-rpc.toml")]
    config: PathBuf,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe every endpoint and print the comprehensive status as JSON
    Status,
    /// Current block number
    BlockNumber,
    /// Balance of an address, in wei
    Balance { address: Address },
    /// Lifecycle state of a submitted transaction
    TxStatus { hash: B256 },
    /// Probe the endpoints once and print the Prometheus metrics
    Metrics,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = AppConfig::load(Some(args.config.as_path()))
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    init_logging(&config.logging, args.json_logs);

    info!(version = env!("CARGO_PKG_VERSION"), endpoints = config.rpc.endpoints.len(), "agent-rpc starting");

    let telemetry = Arc::new(RpcTelemetry::new().context("Failed to register metrics")?);
    let rpc = Arc::new(
        RpcManager::from_http(config.rpc.clone(), config.pool.clone(), config.monitor.clone())
            .context("Failed to build RPC manager")?
            .with_telemetry(Arc::clone(&telemetry)),
    );

    match args.command {
        Command::Status => {
            probe(&rpc).await;
            let status = rpc.get_comprehensive_status();
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::BlockNumber => {
            let block = rpc.block_number().await.context("eth_blockNumber failed")?;
            println!("{}", block);
        }
        Command::Balance { address } => {
            let balance = rpc.balance(address).await.context("eth_getBalance failed")?;
            println!("{}", balance);
        }
        Command::TxStatus { hash } => {
            let transactions = TransactionManager::new(Arc::clone(&rpc), config.transactions.clone())
                .context("Failed to build transaction manager")?;
            let status = transactions
                .get_transaction_status(hash)
                .await
                .context("Transaction lookup failed")?;
            println!("{}", status);
        }
        Command::Metrics => {
            probe(&rpc).await;
            if let Err(e) = rpc.block_number().await {
                warn!(error = %e, "Probe request failed");
            }
            print!("{}", telemetry.render());
        }
    }

    rpc.stop();
    Ok(())
}

fn init_logging(logging: &LoggingConfig, json_override: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so command output stays parseable.
    if logging.json || json_override {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

/// Connect the pool and run one monitor pass
async fn probe(rpc: &Arc<RpcManager>) {
    rpc.start().await;
    rpc.monitor().check_all().await;
}
