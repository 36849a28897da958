use std::sync::Arc;
use std::time::Duration;

use depshard_consensus::{ReplicaConfig, ShardReplica};
use depshard_core::{Footprint, MacKey, PrepareRequest, ReplicaId, ShardConfig, ShardId, TxId};
use depshard_transport::{run_inbound_loop, LocalNetwork, LocalTransport};

fn fast_config() -> ReplicaConfig {
    ReplicaConfig {
        tick_interval: Duration::from_millis(5),
        batch_timeout: Duration::from_millis(20),
        election_tick: 4,
        heartbeat_tick: 1,
        ..ReplicaConfig::default()
    }
}

async fn wait_until_leader(replica: &Arc<ShardReplica>) {
    for _ in 0..400 {
        if replica.is_leader() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("replica never became leader");
}

fn write_request(tx: &str, key: &str, value: &str) -> PrepareRequest {
    let mut writes = Footprint::new();
    writes.insert(key.to_string(), value.as_bytes().to_vec());
    PrepareRequest::new(TxId::new(tx), ShardId::new("alpha"), Footprint::new(), writes, 0).unwrap()
}

fn read_request(tx: &str, key: &str) -> PrepareRequest {
    let mut reads = Footprint::new();
    reads.insert(key.to_string(), Vec::new());
    PrepareRequest::new(TxId::new(tx), ShardId::new("alpha"), reads, Footprint::new(), 0).unwrap()
}

async fn single_node_replica(config: ReplicaConfig) -> Arc<ShardReplica> {
    let network = Arc::new(LocalNetwork::new());
    let _rx = network.register("node-a");
    let transport = Arc::new(LocalTransport::new(network, "node-a"));
    let (replica, _inbound) = ShardReplica::spawn(
        ShardConfig::single_node(ShardId::new("alpha"), "node-a"),
        config,
        transport,
        MacKey::from_bytes(b"scenario-key"),
    );
    wait_until_leader(&replica).await;
    replica
}

#[tokio::test]
async fn first_write_to_a_key_commits_with_no_dependency() {
    let replica = single_node_replica(fast_config()).await;

    let rx = replica.propose(write_request("tx1", "k1", "v1")).unwrap();
    let proof = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();

    assert!(proof.commit_index >= 1);
    assert!(!proof.has_dependency);
    assert_eq!(replica.dependency_map_len(), 1);
}

#[tokio::test]
async fn reading_a_key_after_its_writer_reports_a_dependency() {
    let replica = single_node_replica(fast_config()).await;

    let rx1 = replica.propose(write_request("tx1", "k1", "v1")).unwrap();
    tokio::time::timeout(Duration::from_secs(2), rx1).await.unwrap().unwrap();

    let rx2 = replica.propose(read_request("tx2", "k1")).unwrap();
    let proof2 = tokio::time::timeout(Duration::from_secs(2), rx2).await.unwrap().unwrap();

    assert!(proof2.has_dependency);
    assert_eq!(proof2.dependent_tx_id, Some(TxId::new("tx1")));
    assert!(proof2.commit_index > 1);
}

#[tokio::test]
async fn second_writer_overwrites_and_carries_a_higher_commit_index() {
    let replica = single_node_replica(fast_config()).await;

    let rx1 = replica.propose(write_request("tx1", "k1", "v1")).unwrap();
    let proof1 = tokio::time::timeout(Duration::from_secs(2), rx1).await.unwrap().unwrap();

    let rx3 = replica.propose(write_request("tx3", "k1", "v2")).unwrap();
    let proof3 = tokio::time::timeout(Duration::from_secs(2), rx3).await.unwrap().unwrap();

    assert!(proof3.has_dependency);
    assert!(proof3.commit_index > proof1.commit_index);
    assert_eq!(replica.dependency_map_len(), 1);
}

#[tokio::test]
async fn ttl_sweep_clears_expired_entries_so_a_later_read_sees_no_dependency() {
    let mut config = fast_config();
    config.expiry_duration = Duration::from_millis(100);
    config.ttl_sweep_interval = Duration::from_millis(20);
    let replica = single_node_replica(config).await;

    let rx1 = replica.propose(write_request("tx1", "k1", "v1")).unwrap();
    tokio::time::timeout(Duration::from_secs(2), rx1).await.unwrap().unwrap();
    assert_eq!(replica.dependency_map_len(), 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(replica.dependency_map_len(), 0);

    let rx2 = replica.propose(read_request("tx2", "k1")).unwrap();
    let proof2 = tokio::time::timeout(Duration::from_secs(2), rx2).await.unwrap().unwrap();
    assert!(!proof2.has_dependency);
}

#[tokio::test]
async fn a_new_leader_is_elected_after_the_old_one_stops_and_keeps_serving() {
    let network = Arc::new(LocalNetwork::new());
    let addrs = ["node-a", "node-b", "node-c"];
    let mut receivers = Vec::new();
    for addr in addrs {
        receivers.push(network.register(addr));
    }

    let config = fast_config();
    let mac_key = MacKey::from_bytes(b"three-node-scenario-key");
    let mut replicas = Vec::new();
    for (i, addr) in addrs.iter().enumerate() {
        let shard_config = ShardConfig {
            shard_id: ShardId::new("alpha"),
            replica_nodes: addrs.iter().map(|a| a.to_string()).collect(),
            replica_id: (i + 1) as ReplicaId,
        };
        let transport = Arc::new(LocalTransport::new(network.clone(), *addr));
        let (replica, inbound) = ShardReplica::spawn(shard_config, config.clone(), transport, mac_key.clone());
        replicas.push(replica);
        let rx = receivers.remove(0);
        tokio::spawn(run_inbound_loop(rx, inbound));
    }

    let find_leader = |replicas: &[Arc<ShardReplica>]| replicas.iter().find(|r| r.is_leader()).cloned();

    let mut first_leader = None;
    for _ in 0..400 {
        if let Some(r) = find_leader(&replicas) {
            first_leader = Some(r);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let first_leader = first_leader.expect("initial leader elected");

    let rx1 = first_leader.propose(write_request("tx1", "k1", "v1")).unwrap();
    let proof1 = tokio::time::timeout(Duration::from_secs(2), rx1).await.unwrap().unwrap();
    assert_eq!(proof1.term, 1);

    first_leader.shutdown();

    let mut new_leader = None;
    for _ in 0..400 {
        if let Some(r) = replicas
            .iter()
            .find(|r| r.is_leader() && !Arc::ptr_eq(r, &first_leader))
        {
            new_leader = Some(r.clone());
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let new_leader = new_leader.expect("a new leader is elected after the old one stops");

    let rx3 = new_leader.propose(write_request("tx3", "k1", "v2")).unwrap();
    let proof3 = tokio::time::timeout(Duration::from_secs(2), rx3).await.unwrap().unwrap();
    assert!(proof3.term > proof1.term);
}
