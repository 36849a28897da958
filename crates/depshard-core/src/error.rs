use thiserror::Error;

/// Errors surfaced by the data model and wire codec.
///
/// These are distinct from the shard replica's operational errors
/// (`NotLeader`, `Busy`, ...) in `depshard-consensus`, which sit one layer
/// up and wrap these where a codec or validation failure bubbles through.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("prepare request {tx_id} has empty read_set and write_set")]
    EmptyFootprint { tx_id: String },

    #[error("encoded entry ({size} bytes) exceeds max_msg_size ({limit} bytes)")]
    TooLarge { size: usize, limit: usize },

    #[error("failed to encode log entry: {0}")]
    EncodeFailed(String),

    /// A decode failure for a single log entry. This is non-fatal at the
    /// apply loop: the entry is skipped and a counter is incremented, it
    /// never halts replication of later entries. It also stands in for
    /// "unknown fields ignored" forward-compatibility: since bincode is a
    /// positional, non-self-describing format, an entry produced by a
    /// newer writer that this process doesn't understand decodes to this
    /// variant rather than to malformed data.
    #[error("failed to decode log entry: {0}")]
    DecodeFailed(String),

    #[error("MAC verification failed for tx {tx_id}")]
    InvalidMac { tx_id: String },
}
