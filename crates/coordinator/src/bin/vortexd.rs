//! The Vortex coordinator daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vortex_bitcoin::{BitcoinRpcClient, FeeOracle, RpcConfig};
use vortex_common::CoordinatorConfig;
use vortex_coordinator::{spawn_listener, Coordinator};
use vortex_crypto::{load_or_create_seed, KeyManager};
use vortex_storage::VortexStore;

#[derive(Debug, Parser)]
#[command(name = "vortexd", about = "CoinJoin round coordinator")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "vortex.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = CoordinatorConfig::load(&args.config).context("failed to load configuration")?;
    info!(
        "Starting coordinator '{}' on {} ({})",
        config.name, config.listen, config.network
    );

    let store = Arc::new(VortexStore::open(config.db_path()).context("failed to open store")?);

    let seed_path = config.data_dir.join(&config.name).join("seed.hex");
    let seed = load_or_create_seed(&seed_path).context("failed to load seed")?;
    let next_index = store
        .max_nonce_index()
        .context("failed to read nonce counter")?
        .map(|i| i + 1)
        .unwrap_or(0);
    let keys = KeyManager::new(&seed, config.network, next_index)
        .context("failed to initialize key manager")?;

    let rpc = Arc::new(BitcoinRpcClient::new(RpcConfig {
        url: config.bitcoind_rpc_url.clone(),
        user: config.bitcoind_rpc_user.clone(),
        password: config.bitcoind_rpc_password.clone(),
    }));
    let fees = FeeOracle::new(
        rpc.clone(),
        config.fallback_fee_url.clone(),
        config.network == bitcoin::Network::Regtest,
    );

    let listen = config.listen.clone();
    let (handle, coordinator_task) = Coordinator::start(config, store, keys, rpc, fees)
        .await
        .context("failed to start coordinator")?;

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {}", listen))?;
    let listener_task = spawn_listener(listener, handle.clone());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    handle.shutdown().await;
    listener_task.abort();
    coordinator_task.await.ok();

    Ok(())
}
