use thiserror::Error;

/// Failure surfaced by the endorser coordinator to its caller. Every
/// variant here corresponds to a partial failure already rolled back:
/// by the time this is returned, `handle_abort` has been sent to every
/// shard the transaction successfully reached.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EndorseError {
    /// At least one involved shard failed to admit, commit, or prove the
    /// request within the shared deadline. `failed_shards` is the count
    /// that did not contribute a verified proof.
    #[error("{failed_shards} of {contacted_shards} shard(s) failed to endorse")]
    ShardFailure {
        failed_shards: usize,
        contacted_shards: usize,
    },
}
