//! Fans a transaction's footprint out to every shard it touches, waits
//! for signed proofs under one shared deadline, and aggregates them into
//! a single dependency verdict. On any partial failure, every shard that
//! was successfully contacted is told to roll the transaction back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::warn;

use depshard_consensus::ShardManager;
use depshard_core::{CommitIndex, Footprint, MacKey, PrepareProof, PrepareRequest, ShardId, Term, TxId};

use crate::error::EndorseError;
use crate::namespace::group_by_namespace;

/// Default time budget for collecting proofs from every involved shard,
/// shared across the whole fan-out rather than per-shard.
pub const DEFAULT_PREPARE_TIMEOUT: Duration = Duration::from_secs(2);

/// A transaction's simulated read/write footprint, ready for endorsement.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub tx_id: TxId,
    pub primary_namespace: String,
    pub read_set: Footprint,
    pub write_set: Footprint,
    pub timestamp_nanos: i64,
}

/// The aggregated dependency verdict across every shard a transaction
/// touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndorsementResult {
    pub tx_id: TxId,
    pub has_dependency: bool,
    pub dependent_tx_id: Option<TxId>,
    pub max_commit_index: CommitIndex,
    pub term_at_max: Term,
}

impl EndorsementResult {
    /// The observable trailer format carried alongside the endorsed
    /// transaction: `DependencyInfo:HasDependency=<bool>,DependentTxID=
    /// <string>,ShardCommitIndex=<u64>,ProofTerm=<u64>`.
    pub fn trailer(&self) -> String {
        format!(
            "DependencyInfo:HasDependency={},DependentTxID={},ShardCommitIndex={},ProofTerm={}",
            self.has_dependency,
            self.dependent_tx_id.as_ref().map(TxId::as_str).unwrap_or(""),
            self.max_commit_index,
            self.term_at_max,
        )
    }
}

fn aggregate(tx_id: TxId, proofs: &[PrepareProof]) -> EndorsementResult {
    let has_dependency = proofs.iter().any(|p| p.commit_index > 1);
    let max_proof = proofs.iter().max_by_key(|p| p.commit_index);
    let max_commit_index = max_proof.map(|p| p.commit_index).unwrap_or(0);
    let term_at_max = max_proof.map(|p| p.term).unwrap_or(0);
    let dependent_tx_id = max_proof.and_then(|p| p.dependent_tx_id.clone());

    EndorsementResult {
        tx_id,
        has_dependency,
        dependent_tx_id,
        max_commit_index,
        term_at_max,
    }
}

pub struct EndorserCoordinator {
    shard_manager: Arc<ShardManager>,
    mac_key: MacKey,
    prepare_timeout: Duration,
}

impl EndorserCoordinator {
    pub fn new(shard_manager: Arc<ShardManager>, mac_key: MacKey) -> Self {
        EndorserCoordinator {
            shard_manager,
            mac_key,
            prepare_timeout: DEFAULT_PREPARE_TIMEOUT,
        }
    }

    pub fn with_prepare_timeout(mut self, timeout: Duration) -> Self {
        self.prepare_timeout = timeout;
        self
    }

    /// Run the full fan-out: group by namespace, propose to every
    /// involved shard concurrently, collect proofs within the shared
    /// deadline, and either aggregate a verdict or abort everywhere this
    /// transaction was admitted.
    #[tracing::instrument(skip(self, sim), fields(tx_id = %sim.tx_id, primary = %sim.primary_namespace))]
    pub async fn endorse(&self, sim: SimulationResult) -> Result<EndorsementResult, EndorseError> {
        let deadline = Instant::now() + self.prepare_timeout;
        let groups = group_by_namespace(&sim.primary_namespace, &sim.read_set, &sim.write_set);

        let mut contacted = Vec::new();
        let mut waiting = Vec::new();
        let mut failed = 0usize;

        for (shard_id, group) in groups {
            let replica = match self.shard_manager.get_or_create(&shard_id) {
                Ok(replica) => replica,
                Err(e) => {
                    warn!(shard = %shard_id, error = %e, "could not acquire shard for endorsement");
                    failed += 1;
                    continue;
                }
            };
            contacted.push(replica.clone());

            if group.is_empty() {
                continue;
            }

            let req = match PrepareRequest::new(
                sim.tx_id.clone(),
                shard_id.clone(),
                group.read_set,
                group.write_set,
                sim.timestamp_nanos,
            ) {
                Ok(req) => req,
                Err(e) => {
                    warn!(shard = %shard_id, error = %e, "invalid prepare request");
                    failed += 1;
                    continue;
                }
            };

            match replica.propose(req) {
                Ok(rx) => waiting.push(rx),
                Err(e) => {
                    warn!(shard = %shard_id, error = %e, "shard refused to admit prepare request");
                    failed += 1;
                }
            }
        }

        let waits = waiting.into_iter().map(|rx| async move {
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::timeout(remaining, rx).await
        });

        let mut proofs = Vec::new();
        for result in join_all(waits).await {
            match result {
                Ok(Ok(proof)) => match self.verify(&proof) {
                    Ok(()) => proofs.push(proof),
                    Err(e) => {
                        warn!(tx_id = %sim.tx_id, error = %e, "proof failed verification");
                        failed += 1;
                    }
                },
                Ok(Err(_)) => {
                    warn!(tx_id = %sim.tx_id, "proof sender dropped before delivering a result");
                    failed += 1;
                }
                Err(_) => {
                    warn!(tx_id = %sim.tx_id, "shard did not prove the request within the shared deadline");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            self.abort_everywhere(&sim.tx_id, &contacted).await;
            return Err(EndorseError::ShardFailure {
                failed_shards: failed,
                contacted_shards: contacted.len(),
            });
        }

        Ok(aggregate(sim.tx_id, &proofs))
    }

    fn verify(&self, proof: &PrepareProof) -> Result<(), depshard_core::CoreError> {
        depshard_core::mac::verify(
            &self.mac_key,
            &proof.shard_id,
            proof.commit_index,
            &proof.tx_id,
            &proof.signature,
        )
    }

    async fn abort_everywhere(&self, tx_id: &TxId, contacted: &[Arc<depshard_consensus::ShardReplica>]) {
        for replica in contacted {
            if let Err(e) = replica.handle_abort(tx_id.clone()).await {
                warn!(shard = %replica.shard_id(), error = %e, "abort propagation failed");
            }
        }
    }
}
