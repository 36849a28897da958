use std::time::Duration;

/// Runtime tuning for one shard replica. Populated from the layered
/// configuration at the binary boundary; every field has the default
/// named in its doc comment.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Max age of the oldest pending request before the batcher flushes.
    pub batch_timeout: Duration,
    /// Max pending requests before the batcher flushes.
    pub batch_max_size: usize,
    /// Cadence of the consensus driver's tick.
    pub tick_interval: Duration,
    /// Ticks of silence before a follower starts an election.
    pub election_tick: u32,
    /// Ticks between a leader's heartbeats.
    pub heartbeat_tick: u32,
    /// Capacity of `ProposeC`.
    pub propose_queue_capacity: usize,
    /// Capacity of the inbound consensus-message queue.
    pub max_inflight_msgs: usize,
    /// Upper bound on one encoded log entry.
    pub max_msg_size: usize,
    /// TTL for dependency-map entries.
    pub expiry_duration: Duration,
    /// Cadence of the TTL sweep task.
    pub ttl_sweep_interval: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            batch_timeout: Duration::from_millis(300),
            batch_max_size: 20,
            tick_interval: Duration::from_millis(100),
            election_tick: 10,
            heartbeat_tick: 1,
            propose_queue_capacity: 1000,
            max_inflight_msgs: 256,
            max_msg_size: depshard_core::codec::DEFAULT_MAX_MSG_SIZE,
            expiry_duration: Duration::from_secs(300),
            ttl_sweep_interval: Duration::from_secs(60),
        }
    }
}
