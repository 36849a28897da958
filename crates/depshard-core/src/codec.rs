//! Canonical wire codec for `LogEntry`s placed into the replicated log.
//!
//! `bincode` encodes `BTreeMap`/`Vec`/struct fields positionally in
//! declaration order, so identical `LogEntry` values always produce
//! identical bytes (the `Footprint` type deliberately uses `BTreeMap`, not
//! `HashMap`, for this reason). There is no cryptographic framing here;
//! integrity of committed entries is provided by consensus, not the codec.

use crate::error::CoreError;
use crate::model::LogEntry;

/// Default bound on one encoded log entry (`max_msg_size` in config).
pub const DEFAULT_MAX_MSG_SIZE: usize = 1024 * 1024;

/// Encode a `LogEntry` to its canonical bytes, rejecting anything that
/// would exceed `max_msg_size`. Bounding at encode time (rather than only
/// at decode time) keeps the log itself free of oversized entries.
pub fn encode(entry: &LogEntry, max_msg_size: usize) -> Result<Vec<u8>, CoreError> {
    let bytes = bincode::serialize(entry).map_err(|e| CoreError::EncodeFailed(e.to_string()))?;
    if bytes.len() > max_msg_size {
        return Err(CoreError::TooLarge {
            size: bytes.len(),
            limit: max_msg_size,
        });
    }
    Ok(bytes)
}

/// Decode a `LogEntry` from canonical bytes. A failure here is always
/// treated as a single bad entry by the apply loop (`BadEntry`): the
/// entry is skipped, never surfaced as a reason to halt replication.
pub fn decode(bytes: &[u8]) -> Result<LogEntry, CoreError> {
    bincode::deserialize(bytes).map_err(|e| CoreError::DecodeFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ShardId, TxId};
    use crate::model::{AbortEntry, Batch, Footprint, PrepareRequest};

    fn sample_batch() -> LogEntry {
        let mut writes = Footprint::new();
        writes.insert("k1".to_string(), b"v1".to_vec());
        let req = PrepareRequest::new(
            TxId::new("tx1"),
            ShardId::new("alpha"),
            Footprint::new(),
            writes,
            42,
        )
        .unwrap();
        LogEntry::Batch(Batch::new(vec![req]))
    }

    #[test]
    fn round_trip_is_byte_identical() {
        let entry = sample_batch();
        let a = encode(&entry, DEFAULT_MAX_MSG_SIZE).unwrap();
        let decoded = decode(&a).unwrap();
        let b = encode(&decoded, DEFAULT_MAX_MSG_SIZE).unwrap();
        assert_eq!(a, b);
        assert_eq!(entry, decoded);
    }

    #[test]
    fn abort_entry_round_trips() {
        let entry = LogEntry::Abort(AbortEntry {
            tx_id: TxId::new("tx9"),
            timestamp_nanos: 7,
        });
        let bytes = encode(&entry, DEFAULT_MAX_MSG_SIZE).unwrap();
        assert_eq!(decode(&bytes).unwrap(), entry);
    }

    #[test]
    fn oversized_entry_is_rejected_at_encode() {
        let entry = sample_batch();
        let err = encode(&entry, 4).unwrap_err();
        assert!(matches!(err, CoreError::TooLarge { .. }));
    }

    #[test]
    fn garbage_bytes_decode_to_bad_entry_error() {
        let err = decode(&[0xff, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, CoreError::DecodeFailed(_)));
    }
}
