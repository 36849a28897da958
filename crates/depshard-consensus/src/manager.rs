//! Lazily creates and owns every shard replica live in this process.
//! Creation is the only operation requiring exclusion; the fast path
//! (an already-created shard) only ever takes a `DashMap` shard read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::info;

use depshard_core::{MacKey, ReplicaId, ShardConfig, ShardId};
use depshard_resilience::HealthSource;
use depshard_transport::{Envelope, Inbound, Transport};

use crate::config::ReplicaConfig;
use crate::error::ReplicaError;
use crate::replica::ShardReplica;

/// Where to find the replica set for each shard. Shards not present fall
/// back to a single-replica topology naming only this process.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub self_address: String,
    pub shards: HashMap<ShardId, Vec<String>>,
}

struct ShardEntry {
    replica: Arc<ShardReplica>,
    inbound: Arc<dyn Inbound>,
}

pub struct ShardManager {
    shards: DashMap<ShardId, ShardEntry>,
    creation_lock: Mutex<()>,
    topology: Topology,
    replica_config: ReplicaConfig,
    transport: Arc<dyn Transport>,
    mac_key: MacKey,
    shutting_down: AtomicBool,
}

impl ShardManager {
    pub fn new(
        topology: Topology,
        replica_config: ReplicaConfig,
        transport: Arc<dyn Transport>,
        mac_key: MacKey,
    ) -> Arc<Self> {
        Arc::new(ShardManager {
            shards: DashMap::new(),
            creation_lock: Mutex::new(()),
            topology,
            replica_config,
            transport,
            mac_key,
            shutting_down: AtomicBool::new(false),
        })
    }

    fn resolve_topology(&self, shard_id: &ShardId) -> ShardConfig {
        match self.topology.shards.get(shard_id) {
            Some(nodes) => {
                let replica_id = nodes
                    .iter()
                    .position(|n| n == &self.topology.self_address)
                    .map(|i| (i + 1) as ReplicaId)
                    .unwrap_or(1);
                ShardConfig {
                    shard_id: shard_id.clone(),
                    replica_nodes: nodes.clone(),
                    replica_id,
                }
            }
            None => ShardConfig::single_node(shard_id.clone(), self.topology.self_address.clone()),
        }
    }

    /// Return the live replica for `shard_id`, creating it (and its
    /// background tasks) on first use. Thread-safe: concurrent callers
    /// racing to create the same shard all observe the same instance.
    pub fn get_or_create(&self, shard_id: &ShardId) -> Result<Arc<ShardReplica>, ReplicaError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ReplicaError::ShuttingDown);
        }
        if let Some(entry) = self.shards.get(shard_id) {
            return Ok(entry.replica.clone());
        }

        let _guard = self.creation_lock.lock();
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ReplicaError::ShuttingDown);
        }
        if let Some(entry) = self.shards.get(shard_id) {
            return Ok(entry.replica.clone());
        }

        let shard_config = self.resolve_topology(shard_id);
        info!(shard = %shard_id, replica_id = shard_config.replica_id, "creating shard replica");
        let (replica, inbound) =
            ShardReplica::spawn(shard_config, self.replica_config.clone(), self.transport.clone(), self.mac_key.clone());
        self.shards.insert(
            shard_id.clone(),
            ShardEntry {
                replica: replica.clone(),
                inbound,
            },
        );
        Ok(replica)
    }

    /// `requests_handled` per live shard.
    pub fn metrics(&self) -> HashMap<ShardId, u64> {
        self.shards
            .iter()
            .map(|e| (e.key().clone(), e.value().replica.requests_handled()))
            .collect()
    }

    /// Stop every shard, in ascending shard-id order. Idempotent.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut ids: Vec<ShardId> = self.shards.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        for id in ids {
            if let Some(entry) = self.shards.get(&id) {
                entry.replica.shutdown();
            }
        }
    }
}

/// Demultiplexes inbound envelopes by `shard_id` to the right replica,
/// lazily creating shards that receive a message before any local caller
/// has addressed them (a peer's leader election traffic can arrive before
/// this process has any pending request for that shard).
#[async_trait]
impl Inbound for ShardManager {
    async fn step(&self, envelope: Envelope) {
        let shard_id = envelope.shard_id.clone();
        if let Some(entry) = self.shards.get(&shard_id) {
            entry.inbound.step(envelope).await;
            return;
        }
        if self.get_or_create(&shard_id).is_ok() {
            if let Some(entry) = self.shards.get(&shard_id) {
                entry.inbound.step(envelope).await;
            }
        }
    }
}

#[async_trait]
impl HealthSource for ShardManager {
    fn dependency_map_sizes(&self) -> HashMap<String, usize> {
        self.shards
            .iter()
            .map(|e| (e.key().to_string(), e.value().replica.dependency_map_len()))
            .collect()
    }

    fn queues_present(&self) -> bool {
        !self.shutting_down.load(Ordering::SeqCst)
    }

    async fn peer_reachable(&self) -> HashMap<String, bool> {
        HashMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depshard_transport::{LocalNetwork, LocalTransport};

    fn manager() -> Arc<ShardManager> {
        let network = Arc::new(LocalNetwork::new());
        let _rx = network.register("node-a");
        let transport = Arc::new(LocalTransport::new(network, "node-a"));
        ShardManager::new(
            Topology {
                self_address: "node-a".to_string(),
                shards: HashMap::new(),
            },
            ReplicaConfig::default(),
            transport,
            MacKey::from_bytes(b"test-key"),
        )
    }

    #[tokio::test]
    async fn get_or_create_returns_the_same_instance() {
        let manager = manager();
        let shard_id = ShardId::new("alpha");
        let a = manager.get_or_create(&shard_id).unwrap();
        let b = manager.get_or_create(&shard_id).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn metrics_reports_zero_for_a_freshly_created_shard() {
        let manager = manager();
        manager.get_or_create(&ShardId::new("alpha")).unwrap();
        let metrics = manager.metrics();
        assert_eq!(metrics.get(&ShardId::new("alpha")), Some(&0));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_rejects_new_shards() {
        let manager = manager();
        manager.get_or_create(&ShardId::new("alpha")).unwrap();
        manager.shutdown();
        manager.shutdown();
        let err = manager.get_or_create(&ShardId::new("beta")).unwrap_err();
        assert_eq!(err, ReplicaError::ShuttingDown);
    }
}
