//! Deterministic keyed MAC over a proof's `(shard_id, commit_index,
//! tx_id)` tuple. The spec calls for "a deterministic MAC... for the
//! interface contract", not a production signature scheme, so HMAC-SHA256
//! via `ring` (already in the teacher stack's crypto toolbox) is enough:
//! any two processes holding the same key independently compute the same
//! tag for the same tuple.

use ring::hmac;

use crate::error::CoreError;
use crate::ids::{CommitIndex, ShardId, TxId};

/// A shared MAC key. Cloning is cheap; `ring::hmac::Key` is itself
/// immutable key material wrapped for repeated use.
#[derive(Clone)]
pub struct MacKey(hmac::Key);

impl MacKey {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        MacKey(hmac::Key::new(hmac::HMAC_SHA256, bytes))
    }

    /// Generate a process-local random key, used when no
    /// `DEPSHARD_MAC_KEY` is configured. Since the dependency map itself
    /// is not persisted across restarts (see spec Non-goals), a fresh
    /// per-process key never invalidates anything a restart didn't
    /// already drop.
    pub fn random() -> Self {
        use ring::rand::{SecureRandom, SystemRandom};
        let rng = SystemRandom::new();
        let mut bytes = [0u8; 32];
        // SystemRandom::fill only fails on catastrophic OS RNG failure;
        // there is no meaningful fallback, so this is the one place in
        // the crate where a panic is the correct response.
        rng.fill(&mut bytes).expect("system RNG unavailable");
        MacKey::from_bytes(&bytes)
    }
}

fn tuple_bytes(shard_id: &ShardId, commit_index: CommitIndex, tx_id: &TxId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(shard_id.as_str().len() + 8 + tx_id.as_str().len());
    buf.extend_from_slice(shard_id.as_str().as_bytes());
    buf.extend_from_slice(&commit_index.to_be_bytes());
    buf.extend_from_slice(tx_id.as_str().as_bytes());
    buf
}

/// Produce the signature carried on a `PrepareProof`.
pub fn sign(key: &MacKey, shard_id: &ShardId, commit_index: CommitIndex, tx_id: &TxId) -> Vec<u8> {
    let tag = hmac::sign(&key.0, &tuple_bytes(shard_id, commit_index, tx_id));
    tag.as_ref().to_vec()
}

/// Verify a proof's signature over the same tuple. Returns `Err` with the
/// tx_id for diagnostics on mismatch; this is mapped to `InvalidProof` one
/// layer up.
pub fn verify(
    key: &MacKey,
    shard_id: &ShardId,
    commit_index: CommitIndex,
    tx_id: &TxId,
    signature: &[u8],
) -> Result<(), CoreError> {
    hmac::verify(&key.0, &tuple_bytes(shard_id, commit_index, tx_id), signature).map_err(|_| {
        CoreError::InvalidMac {
            tx_id: tx_id.as_str().to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_succeeds() {
        let key = MacKey::from_bytes(b"shared-secret-key-bytes");
        let shard = ShardId::new("alpha");
        let tx = TxId::new("tx1");
        let sig = sign(&key, &shard, 7, &tx);
        assert!(verify(&key, &shard, 7, &tx, &sig).is_ok());
    }

    #[test]
    fn verify_rejects_tampered_index() {
        let key = MacKey::from_bytes(b"shared-secret-key-bytes");
        let shard = ShardId::new("alpha");
        let tx = TxId::new("tx1");
        let sig = sign(&key, &shard, 7, &tx);
        assert!(verify(&key, &shard, 8, &tx, &sig).is_err());
    }

    #[test]
    fn two_keys_holding_same_bytes_agree() {
        let a = MacKey::from_bytes(b"same-bytes-same-bytes");
        let b = MacKey::from_bytes(b"same-bytes-same-bytes");
        let shard = ShardId::new("beta");
        let tx = TxId::new("tx2");
        let sig = sign(&a, &shard, 3, &tx);
        assert!(verify(&b, &shard, 3, &tx, &sig).is_ok());
    }
}
