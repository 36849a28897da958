//! Layered configuration: a TOML file plus `DEPSHARD_`-prefixed
//! environment overrides, deserialized into `Settings`.

use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use depshard_consensus::ReplicaConfig;
use depshard_core::{MacKey, ShardId};
use depshard_resilience::CircuitBreakerConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerSettings {
    pub threshold: u32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_interval_secs: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        CircuitBreakerSettings {
            threshold: defaults.threshold,
            timeout_secs: defaults.open_timeout.as_secs(),
            max_retries: defaults.max_retries,
            retry_interval_secs: defaults.retry_interval.as_secs(),
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(s: &CircuitBreakerSettings) -> Self {
        CircuitBreakerConfig {
            threshold: s.threshold,
            open_timeout: Duration::from_secs(s.timeout_secs),
            max_retries: s.max_retries,
            retry_interval: Duration::from_secs(s.retry_interval_secs),
        }
    }
}

/// Everything the `depshard` binary needs to start serving. Field names
/// mirror the configuration keys in the external-interfaces section of
/// the service's design: `batch_timeout`, `batch_max_size`,
/// `prepare_timeout`, `expiry_duration`, `election_tick`,
/// `heartbeat_tick`, `max_inflight_msgs`, `max_msg_size`,
/// `circuit_breaker.*`, `shard_topology_file`.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub self_address: String,
    pub shard_topology_file: Option<String>,
    pub mac_key_hex: Option<String>,

    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,
    #[serde(default = "default_prepare_timeout_ms")]
    pub prepare_timeout_ms: u64,
    #[serde(default = "default_expiry_duration_secs")]
    pub expiry_duration_secs: u64,
    #[serde(default = "default_election_tick")]
    pub election_tick: u32,
    #[serde(default = "default_heartbeat_tick")]
    pub heartbeat_tick: u32,
    #[serde(default = "default_max_inflight_msgs")]
    pub max_inflight_msgs: usize,
    #[serde(default = "default_max_msg_size")]
    pub max_msg_size: usize,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
}

fn default_batch_timeout_ms() -> u64 {
    300
}
fn default_batch_max_size() -> usize {
    20
}
fn default_prepare_timeout_ms() -> u64 {
    2_000
}
fn default_expiry_duration_secs() -> u64 {
    300
}
fn default_election_tick() -> u32 {
    10
}
fn default_heartbeat_tick() -> u32 {
    1
}
fn default_max_inflight_msgs() -> usize {
    256
}
fn default_max_msg_size() -> usize {
    depshard_core::codec::DEFAULT_MAX_MSG_SIZE
}

impl Settings {
    /// Load `path` (if it exists) layered under `DEPSHARD_`-prefixed
    /// environment variables, with environment values taking precedence.
    pub fn load(path: Option<&str>, self_address_override: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("DEPSHARD")
                .separator("__")
                .try_parsing(true),
        );
        let mut settings: Settings = builder.build()?.try_deserialize().context("loading configuration")?;
        if let Some(address) = self_address_override {
            settings.self_address = address.to_string();
        }
        if settings.self_address.is_empty() {
            bail!(
                "self_address is not set: pass --self-address, set DEPSHARD_SELF_ADDRESS, \
                 or add self_address to the config file"
            );
        }
        Ok(settings)
    }

    pub fn replica_config(&self) -> ReplicaConfig {
        ReplicaConfig {
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
            batch_max_size: self.batch_max_size,
            election_tick: self.election_tick,
            heartbeat_tick: self.heartbeat_tick,
            max_inflight_msgs: self.max_inflight_msgs,
            max_msg_size: self.max_msg_size,
            expiry_duration: Duration::from_secs(self.expiry_duration_secs),
            ..ReplicaConfig::default()
        }
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms)
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::from(&self.circuit_breaker)
    }

    /// Read the MAC key from `mac_key_hex` if present, otherwise generate
    /// a process-local random key (see the data model's notes on why
    /// this is safe for a non-persistent dependency map).
    pub fn mac_key(&self) -> Result<MacKey> {
        match &self.mac_key_hex {
            Some(hex_str) => {
                let bytes = hex::decode(hex_str).context("DEPSHARD_MAC_KEY is not valid hex")?;
                Ok(MacKey::from_bytes(&bytes))
            }
            None => Ok(MacKey::random()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TopologyFile {
    self_address: String,
    shards: HashMap<String, Vec<String>>,
}

/// Parse the JSON file named by `shard_topology_file` into a
/// `depshard_consensus::Topology`. Shards absent from this file fall back
/// to the manager's single-replica default at first use.
pub fn load_topology(path: &str, self_address: &str) -> Result<depshard_consensus::Topology> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading topology file {path}"))?;
    let parsed: TopologyFile = serde_json::from_str(&raw).context("parsing topology file")?;
    let shards = parsed
        .shards
        .into_iter()
        .map(|(shard, nodes)| (ShardId::new(shard), nodes))
        .collect();
    Ok(depshard_consensus::Topology {
        self_address: if self_address.is_empty() {
            parsed.self_address
        } else {
            self_address.to_string()
        },
        shards,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fails_without_any_self_address() {
        let err = Settings::load(None, None).unwrap_err();
        assert!(err.to_string().contains("self_address"));
    }

    #[test]
    fn cli_override_satisfies_self_address() {
        let settings = Settings::load(None, Some("127.0.0.1:7000")).unwrap();
        assert_eq!(settings.self_address, "127.0.0.1:7000");
        assert_eq!(settings.batch_max_size, 20);
        assert_eq!(settings.election_tick, 10);
    }

    #[test]
    fn circuit_breaker_defaults_match_resilience_crate_defaults() {
        let settings = Settings::load(None, Some("peer")).unwrap();
        let cb = settings.circuit_breaker_config();
        let defaults = CircuitBreakerConfig::default();
        assert_eq!(cb.threshold, defaults.threshold);
        assert_eq!(cb.max_retries, defaults.max_retries);
    }
}
