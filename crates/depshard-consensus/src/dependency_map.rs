//! Per-shard in-memory map from key to its most recent writer, with TTL
//! expiry. Exclusively owned by the apply loop for writes; the TTL sweep
//! takes a brief per-key lock only to delete, and metrics readers only
//! ever see a consistent snapshot of sizes, never partial writes.

use std::time::Duration;

use dashmap::DashMap;

use depshard_core::{DependencyMapEntry, PrepareRequest, TxId};

pub struct DependencyMap {
    entries: DashMap<String, DependencyMapEntry>,
    ttl: Duration,
}

impl DependencyMap {
    pub fn new(ttl: Duration) -> Self {
        DependencyMap {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply one committed `PrepareRequest`: detect read-after-write and
    /// write-after-write dependencies against the current map state, then
    /// overwrite every written key. Returns whether any dependency was
    /// observed and the most recent conflicting writer, if any.
    ///
    /// Read set is checked before write set is applied, so a request that
    /// both reads and writes the same key sees its own prior writer (if
    /// any) on the read check rather than the write it is about to make.
    pub fn check_and_update(&self, req: &PrepareRequest, now_millis: i64) -> (bool, Option<TxId>) {
        let mut has_dependency = false;
        let mut dependent_tx_id = None;

        for key in req.read_set.keys() {
            if let Some(existing) = self.entries.get(key) {
                if existing.last_writer_tx_id != req.tx_id {
                    has_dependency = true;
                    dependent_tx_id = Some(existing.last_writer_tx_id.clone());
                }
            }
        }

        let expiry_time_millis = now_millis + self.ttl.as_millis() as i64;
        for (key, value) in req.write_set.iter() {
            let mut write_has_dependency = false;
            if let Some(existing) = self.entries.get(key) {
                if existing.last_writer_tx_id != req.tx_id {
                    write_has_dependency = true;
                    has_dependency = true;
                    dependent_tx_id = Some(existing.last_writer_tx_id.clone());
                }
            }
            self.entries.insert(
                key.clone(),
                DependencyMapEntry {
                    value: value.clone(),
                    last_writer_tx_id: req.tx_id.clone(),
                    expiry_time_millis,
                    has_dependency: write_has_dependency,
                },
            );
        }

        (has_dependency, dependent_tx_id)
    }

    /// Remove every entry written by `tx_id` (apply-side effect of an
    /// `AbortEntry`). Returns the number of entries removed.
    pub fn remove_writer(&self, tx_id: &TxId) -> usize {
        let victims: Vec<String> = self
            .entries
            .iter()
            .filter(|e| &e.value().last_writer_tx_id == tx_id)
            .map(|e| e.key().clone())
            .collect();
        for key in &victims {
            self.entries.remove(key);
        }
        victims.len()
    }

    /// Remove every entry whose expiry has passed. Collects victim keys
    /// in a lock-free pass, then deletes them.
    pub fn sweep_expired(&self, now_millis: i64) -> usize {
        let victims: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().expiry_time_millis <= now_millis)
            .map(|e| e.key().clone())
            .collect();
        for key in &victims {
            self.entries.remove(key);
        }
        victims.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depshard_core::{Footprint, ShardId};

    fn req(tx: &str, reads: &[&str], writes: &[(&str, &str)]) -> PrepareRequest {
        let mut read_set = Footprint::new();
        for k in reads {
            read_set.insert(k.to_string(), b"ignored".to_vec());
        }
        let mut write_set = Footprint::new();
        for (k, v) in writes {
            write_set.insert(k.to_string(), v.as_bytes().to_vec());
        }
        PrepareRequest::new(TxId::new(tx), ShardId::new("alpha"), read_set, write_set, 0).unwrap()
    }

    #[test]
    fn first_write_has_no_dependency() {
        let map = DependencyMap::new(Duration::from_secs(300));
        let (has_dep, dep_tx) = map.check_and_update(&req("tx1", &[], &[("k1", "v1")]), 0);
        assert!(!has_dep);
        assert!(dep_tx.is_none());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn read_after_write_is_detected_without_changing_the_entry() {
        let map = DependencyMap::new(Duration::from_secs(300));
        map.check_and_update(&req("tx1", &[], &[("k1", "v1")]), 0);

        let (has_dep, dep_tx) = map.check_and_update(&req("tx2", &["k1"], &[]), 0);
        assert!(has_dep);
        assert_eq!(dep_tx, Some(TxId::new("tx1")));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn write_after_write_overwrites_and_flags_dependency() {
        let map = DependencyMap::new(Duration::from_secs(300));
        map.check_and_update(&req("tx1", &[], &[("k1", "v1")]), 0);

        let (has_dep, dep_tx) = map.check_and_update(&req("tx3", &[], &[("k1", "v2")]), 0);
        assert!(has_dep);
        assert_eq!(dep_tx, Some(TxId::new("tx1")));

        let (has_dep_next, _) = map.check_and_update(&req("tx3", &["k1"], &[]), 0);
        assert!(!has_dep_next, "reading back one's own last write is not a dependency");
    }

    #[test]
    fn expired_entries_are_swept() {
        let map = DependencyMap::new(Duration::from_millis(100));
        map.check_and_update(&req("tx1", &[], &[("k1", "v1")]), 0);
        assert_eq!(map.len(), 1);

        let removed = map.sweep_expired(50);
        assert_eq!(removed, 0);

        let removed = map.sweep_expired(200);
        assert_eq!(removed, 1);
        assert!(map.is_empty());
    }

    #[test]
    fn abort_removes_every_entry_from_that_writer() {
        let map = DependencyMap::new(Duration::from_secs(300));
        map.check_and_update(&req("tx1", &[], &[("k1", "v1"), ("k2", "v2")]), 0);
        map.check_and_update(&req("tx2", &[], &[("k3", "v3")]), 0);

        let removed = map.remove_writer(&TxId::new("tx1"));
        assert_eq!(removed, 2);
        assert_eq!(map.len(), 1);
    }
}
