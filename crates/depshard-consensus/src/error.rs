use thiserror::Error;

/// Operational errors surfaced by a shard replica to its callers (the
/// endorser coordinator). Distinct from `depshard_core::CoreError`, which
/// covers data-model/codec failures one layer down.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplicaError {
    #[error("propose attempted on a non-leader replica")]
    NotLeader,

    #[error("propose queue is full")]
    Busy,

    #[error("deadline expired before a proof was received")]
    Timeout,

    #[error("proof signature or shape check failed")]
    InvalidProof,

    #[error("operation attempted after shutdown")]
    ShuttingDown,
}
