use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::{CommitIndex, ReplicaId, ShardId, Term, TxId};

/// A read or write footprint: key -> value bytes. Keys are unique within a
/// set by construction (`BTreeMap`), which also gives canonical, order-
/// independent iteration so the wire codec produces identical bytes for
/// identical logical content.
pub type Footprint = BTreeMap<String, Vec<u8>>;

/// One in-flight dependency query submitted by the endorser coordinator.
///
/// Invariant: at least one of `read_set`/`write_set` is non-empty, and
/// `shard_id` matches the shard that receives it. The non-empty invariant
/// is enforced at construction; the shard_id match is enforced by the
/// replica on receipt (a request arriving on the wrong shard is a
/// programmer error, not a runtime condition worth a variant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub tx_id: TxId,
    pub shard_id: ShardId,
    pub read_set: Footprint,
    pub write_set: Footprint,
    /// Monotonic send time, nanoseconds.
    pub timestamp_nanos: i64,
}

impl PrepareRequest {
    pub fn new(
        tx_id: TxId,
        shard_id: ShardId,
        read_set: Footprint,
        write_set: Footprint,
        timestamp_nanos: i64,
    ) -> Result<Self, CoreError> {
        if read_set.is_empty() && write_set.is_empty() {
            return Err(CoreError::EmptyFootprint {
                tx_id: tx_id.as_str().to_string(),
            });
        }
        Ok(PrepareRequest {
            tx_id,
            shard_id,
            read_set,
            write_set,
            timestamp_nanos,
        })
    }
}

/// A size- and age-bounded group of `PrepareRequest`s proposed as one log
/// entry. Order within a batch reflects arrival order at the leader.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub requests: Vec<PrepareRequest>,
}

impl Batch {
    pub fn new(requests: Vec<PrepareRequest>) -> Self {
        Batch { requests }
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }
}

/// Request to remove every dependency-map entry written by `tx_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortEntry {
    pub tx_id: TxId,
    pub timestamp_nanos: i64,
}

/// The unit carried in the replicated log: either a batch of prepare
/// requests, or an abort. Once an index is committed, every replica
/// applies the same entry at that index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntry {
    Batch(Batch),
    Abort(AbortEntry),
}

/// Per-key record in a shard's dependency map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyMapEntry {
    pub value: Vec<u8>,
    pub last_writer_tx_id: TxId,
    /// Unix millis after which this entry is eligible for TTL sweep.
    pub expiry_time_millis: i64,
    pub has_dependency: bool,
}

/// Signed receipt that the log committed a `PrepareRequest` at a given
/// index and term, carrying the dependency observation computed by the
/// apply loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareProof {
    pub tx_id: TxId,
    pub shard_id: ShardId,
    pub commit_index: CommitIndex,
    pub leader_id: ReplicaId,
    pub term: Term,
    pub signature: Vec<u8>,
    pub has_dependency: bool,
    /// The most recent conflicting writer observed while applying this
    /// request, if any. Carried all the way through to the endorser
    /// trailer so a caller can see which transaction it depends on, not
    /// just that a dependency exists.
    pub dependent_tx_id: Option<TxId>,
}

/// Static replica topology for one shard.
///
/// Invariant: `replica_id` is a 1-based index into `replica_nodes`, and
/// across all processes serving this shard, replica_ids are unique and
/// contiguous (1..=replica_nodes.len()).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub shard_id: ShardId,
    pub replica_nodes: Vec<String>,
    pub replica_id: ReplicaId,
}

impl ShardConfig {
    pub fn single_node(shard_id: ShardId, self_address: impl Into<String>) -> Self {
        ShardConfig {
            shard_id,
            replica_nodes: vec![self_address.into()],
            replica_id: 1,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.replica_nodes.len()
    }

    /// Majority quorum size for this topology (including self).
    pub fn quorum_size(&self) -> usize {
        self.replica_nodes.len() / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_request_rejects_empty_footprint() {
        let err = PrepareRequest::new(
            TxId::new("tx1"),
            ShardId::new("alpha"),
            Footprint::new(),
            Footprint::new(),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::EmptyFootprint { .. }));
    }

    #[test]
    fn prepare_request_accepts_write_only() {
        let mut writes = Footprint::new();
        writes.insert("k1".to_string(), b"v1".to_vec());
        let req = PrepareRequest::new(
            TxId::new("tx1"),
            ShardId::new("alpha"),
            Footprint::new(),
            writes,
            0,
        )
        .unwrap();
        assert_eq!(req.write_set.len(), 1);
    }

    #[test]
    fn quorum_size_is_majority() {
        let cfg = ShardConfig {
            shard_id: ShardId::new("alpha"),
            replica_nodes: vec!["a".into(), "b".into(), "c".into()],
            replica_id: 1,
        };
        assert_eq!(cfg.quorum_size(), 2);
    }
}
