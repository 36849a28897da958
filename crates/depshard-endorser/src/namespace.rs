//! Splits a transaction's flat read/write footprints into per-namespace
//! groups the coordinator can fan out to individual shards.

use std::collections::BTreeMap;

use depshard_core::{Footprint, ShardId};

/// Keys under these namespaces never leave this process; they describe
/// process-local bookkeeping, not application state a shard should track.
const SYSTEM_NAMESPACE_PREFIXES: &[&str] = &["$system", "_lifecycle"];

#[derive(Debug, Clone, Default)]
pub struct NamespaceGroup {
    pub read_set: Footprint,
    pub write_set: Footprint,
}

impl NamespaceGroup {
    pub fn is_empty(&self) -> bool {
        self.read_set.is_empty() && self.write_set.is_empty()
    }
}

/// A key is formatted `namespace[:collection]:key`; the namespace (plus
/// any collection suffix) is everything before the last `:`, and the
/// final segment is the key proper within that shard.
fn namespace_of(key: &str) -> Option<&str> {
    key.rsplit_once(':').map(|(namespace, _)| namespace)
}

fn is_system_namespace(namespace: &str) -> bool {
    SYSTEM_NAMESPACE_PREFIXES.iter().any(|p| *p == namespace)
}

/// Group `read_set`/`write_set` by namespace, always including
/// `primary_namespace` even when it ends up with no keys of its own.
pub fn group_by_namespace(
    primary_namespace: &str,
    read_set: &Footprint,
    write_set: &Footprint,
) -> BTreeMap<ShardId, NamespaceGroup> {
    let mut groups: BTreeMap<ShardId, NamespaceGroup> = BTreeMap::new();
    groups.insert(ShardId::new(primary_namespace), NamespaceGroup::default());

    for (key, value) in read_set {
        let Some(namespace) = namespace_of(key) else { continue };
        if is_system_namespace(namespace) {
            continue;
        }
        groups
            .entry(ShardId::new(namespace))
            .or_default()
            .read_set
            .insert(key.clone(), value.clone());
    }

    for (key, value) in write_set {
        let Some(namespace) = namespace_of(key) else { continue };
        if is_system_namespace(namespace) {
            continue;
        }
        groups
            .entry(ShardId::new(namespace))
            .or_default()
            .write_set
            .insert(key.clone(), value.clone());
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_namespace_is_present_even_with_no_keys() {
        let groups = group_by_namespace("alpha", &Footprint::new(), &Footprint::new());
        assert_eq!(groups.len(), 1);
        assert!(groups[&ShardId::new("alpha")].is_empty());
    }

    #[test]
    fn keys_are_grouped_by_the_segment_before_the_last_colon() {
        let mut reads = Footprint::new();
        reads.insert("alpha:k1".to_string(), Vec::new());
        let mut writes = Footprint::new();
        writes.insert("beta:coll1:k2".to_string(), b"v".to_vec());

        let groups = group_by_namespace("alpha", &reads, &writes);

        assert_eq!(groups.len(), 2);
        assert!(groups[&ShardId::new("alpha")].read_set.contains_key("alpha:k1"));
        assert!(groups[&ShardId::new("beta:coll1")].write_set.contains_key("beta:coll1:k2"));
    }

    #[test]
    fn system_namespace_keys_are_dropped() {
        let mut writes = Footprint::new();
        writes.insert("$system:counter".to_string(), b"1".to_vec());
        let groups = group_by_namespace("alpha", &Footprint::new(), &writes);
        assert!(!groups.contains_key(&ShardId::new("$system")));
    }

    #[test]
    fn a_key_with_no_namespace_separator_is_ignored() {
        let mut writes = Footprint::new();
        writes.insert("barekey".to_string(), b"v".to_vec());
        let groups = group_by_namespace("alpha", &Footprint::new(), &writes);
        assert_eq!(groups.len(), 1);
    }
}
