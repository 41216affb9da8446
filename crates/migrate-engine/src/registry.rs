//! Process-lifetime registries: the emigration registry, the immigration
//! registry, and the secondary-record version index.
//!
//! All three are initialized once in `MigrationEngine::init` and never
//! torn down (spec.md §9). Entries are `Arc`-shared: the registry holds
//! one reference, and each accessor (worker, ack dispatcher, reaper)
//! takes an additional clone for the duration of its use -- `DashMap`
//! gives us the "many-lock hash" concurrency spec.md §5 asks for, the
//! same structure the teacher uses for `ClusterPartitionTable` and its
//! connection registry.

use std::sync::Arc;

use dashmap::DashMap;

use migrate_types::{EmigId, NodeId, PartitionId, Version};

use crate::emigration::Emigration;
use crate::immigration::Immigration;

/// Indexed by the locally generated `emig_id`, used to route
/// acknowledgments back to their originating job.
#[derive(Default)]
pub struct EmigrationRegistry {
    table: DashMap<EmigId, Arc<Emigration>>,
}

impl EmigrationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, emigration: Arc<Emigration>) {
        self.table.insert(emigration.emig_id, emigration);
    }

    #[must_use]
    pub fn get(&self, emig_id: EmigId) -> Option<Arc<Emigration>> {
        self.table.get(&emig_id).map(|e| Arc::clone(e.value()))
    }

    pub fn remove(&self, emig_id: EmigId) {
        self.table.remove(&emig_id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// One summary line per active emigration, for `dump(verbose)`.
    #[must_use]
    pub fn dump_lines(&self) -> Vec<String> {
        self.table
            .iter()
            .map(|entry| {
                let e = entry.value();
                format!(
                    "emigration emig_id={} namespace={} partition={} destination={} in_flight={}",
                    e.emig_id.0,
                    e.namespace(),
                    e.partition().0,
                    e.destination(),
                    e.inflight.len(),
                )
            })
            .collect()
    }
}

/// Indexed by `(source_node, emig_id)`.
#[derive(Default)]
pub struct ImmigrationRegistry {
    table: DashMap<(NodeId, EmigId), Arc<Immigration>>,
}

impl ImmigrationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `immigration` only if no entry already exists for its key.
    /// Returns `true` on success; `false` means a duplicate `START`
    /// arrived and the new immigration must be discarded by the caller.
    #[must_use]
    pub fn insert_if_absent(&self, immigration: Arc<Immigration>) -> bool {
        let key = (immigration.source.clone(), immigration.emig_id);
        match self.table.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(immigration);
                true
            }
        }
    }

    #[must_use]
    pub fn get(&self, source: &NodeId, emig_id: EmigId) -> Option<Arc<Immigration>> {
        self.table
            .get(&(source.clone(), emig_id))
            .map(|e| Arc::clone(e.value()))
    }

    pub fn remove(&self, source: &NodeId, emig_id: EmigId) -> Option<Arc<Immigration>> {
        self.table.remove(&(source.clone(), emig_id)).map(|(_, v)| v)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Snapshots every currently registered immigration. Used by the
    /// reaper sweep and by `dump(verbose)`.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Immigration>> {
        self.table.iter().map(|e| Arc::clone(e.value())).collect()
    }

    #[must_use]
    pub fn dump_lines(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|i| {
                format!(
                    "immigration emig_id={} source={} namespace={} partition={} done_received={}",
                    i.emig_id.0,
                    i.source,
                    i.namespace,
                    i.partition.0,
                    i.done_received(),
                )
            })
            .collect()
    }
}

/// Maps `(version, partition_id) -> immigration`, letting the read path
/// check whether a secondary record is currently mid-import
/// (`is_incoming`) without going through the main registry key.
#[derive(Default)]
pub struct SubRecordVersionIndex {
    table: DashMap<(Version, PartitionId), Arc<Immigration>>,
}

impl SubRecordVersionIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, version: Version, partition: PartitionId, immigration: Arc<Immigration>) {
        self.table.insert((version, partition), immigration);
    }

    #[must_use]
    pub fn get(&self, version: Version, partition: PartitionId) -> Option<Arc<Immigration>> {
        self.table
            .get(&(version, partition))
            .map(|e| Arc::clone(e.value()))
    }

    pub fn remove(&self, version: Version, partition: PartitionId) {
        self.table.remove(&(version, partition));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::immigration::Immigration;
    use migrate_types::ClusterKey;

    fn immigration(source: &str, emig_id: u32) -> Arc<Immigration> {
        Arc::new(Immigration::new(
            source.into(),
            EmigId(emig_id),
            ClusterKey(1),
            "ns".into(),
            PartitionId(1),
            None,
        ))
    }

    #[test]
    fn insert_if_absent_rejects_duplicate_start() {
        let registry = ImmigrationRegistry::new();
        assert!(registry.insert_if_absent(immigration("node-a", 1)));
        assert!(!registry.insert_if_absent(immigration("node-a", 1)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn different_source_same_emig_id_is_a_distinct_entry() {
        let registry = ImmigrationRegistry::new();
        assert!(registry.insert_if_absent(immigration("node-a", 1)));
        assert!(registry.insert_if_absent(immigration("node-b", 1)));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn remove_drops_the_entry() {
        let registry = ImmigrationRegistry::new();
        registry.insert_if_absent(immigration("node-a", 1));
        assert!(registry.remove(&"node-a".into(), EmigId(1)).is_some());
        assert!(registry.get(&"node-a".into(), EmigId(1)).is_none());
    }

    #[test]
    fn version_index_insert_get_remove() {
        let index = SubRecordVersionIndex::new();
        let imm = immigration("node-a", 1);
        index.insert(Version(7), PartitionId(1), Arc::clone(&imm));
        assert!(index.get(Version(7), PartitionId(1)).is_some());
        index.remove(Version(7), PartitionId(1));
        assert!(index.get(Version(7), PartitionId(1)).is_none());
    }
}
