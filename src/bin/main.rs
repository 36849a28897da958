//! Peer-embedded entrypoint: wires configuration, transport, the shard
//! manager, the health monitor, and the endorser coordinator together and
//! runs until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use depshard::config::{load_topology, Settings};
use depshard_consensus::{ShardManager, Topology};
use depshard_resilience::HealthMonitor;
use depshard_transport::{run_inbound_loop, LocalNetwork, LocalTransport};
use tracing::info;

#[derive(Parser)]
#[command(name = "depshard")]
#[command(about = "Sharded dependency-tracking service", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file (optional; env vars still apply).
    #[arg(long)]
    config: Option<String>,

    /// Overrides `self_address` from the configuration file/environment.
    #[arg(long)]
    self_address: Option<String>,

    /// Path to a JSON shard topology file, overriding `shard_topology_file`.
    #[arg(long)]
    topology: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref(), cli.self_address.as_deref())
        .context("loading settings")?;

    let topology_path = cli.topology.or_else(|| settings.shard_topology_file.clone());
    let topology = match &topology_path {
        Some(path) => load_topology(path, &settings.self_address).context("loading shard topology")?,
        None => Topology {
            self_address: settings.self_address.clone(),
            shards: Default::default(),
        },
    };

    let network = Arc::new(LocalNetwork::new());
    let inbound_rx = network.register(&settings.self_address);
    let transport = Arc::new(LocalTransport::new(network, &settings.self_address));
    let mac_key = settings.mac_key()?;

    let manager = ShardManager::new(topology, settings.replica_config(), transport, mac_key);
    tokio::spawn(run_inbound_loop(inbound_rx, manager.clone()));

    let health_monitor = Arc::new(HealthMonitor::new());
    tokio::spawn(health_monitor.clone().run(manager.clone(), depshard_resilience::HEALTH_CHECK_INTERVAL));

    info!(self_address = %settings.self_address, "depshard service started");

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received, stopping shard replicas");
    manager.shutdown();

    Ok(())
}
