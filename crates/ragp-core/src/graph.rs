//! Graph store: the read/write facade over base, delta, cache and registry.
//!
//! The read path overlays the delta index onto the chunked base (served
//! through the hybrid cache), yielding the effective outgoing synapses for
//! a sender: for each `(receiver, weight, tick)` pending in the delta, the
//! base entry is replaced when the delta tick is at least the base tick,
//! inserted when the base has no entry, and a zero weight acts as a
//! tombstone. Results are materialized so callers hold a stable view for
//! one activation step.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use tracing::{info, warn};

use crate::cache::{CacheStats, HybridCache};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::registry::{InnateRegistry, NodeId, NodeKind, Tick};
use crate::storage::base::BaseStore;
use crate::storage::delta::{DeltaIndex, DeltaLog, DeltaRecord};
use crate::storage::SynapseRec;

/// Counters returned by a consolidation merge
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct MergeStats {
    pub(crate) merged: u32,
    pub(crate) pruned: u32,
    pub(crate) senders: u32,
}

/// Durable graph state plus its in-memory overlays
#[derive(Debug)]
pub(crate) struct GraphStore {
    base: BaseStore,
    delta_log: DeltaLog,
    delta_index: DeltaIndex,
    cache: HybridCache,
    registry: InnateRegistry,
    prune_threshold: f32,
    degraded: bool,
}

impl GraphStore {
    /// Open the store rooted at `dir`, replaying the delta log.
    ///
    /// Returns the store and the newest persisted tick, from which the
    /// engine resumes its counter.
    pub(crate) fn open(dir: &Path, cfg: &EngineConfig) -> Result<(Self, Tick)> {
        let base = BaseStore::open(dir, cfg.chunk_span)?;
        let registry = InnateRegistry::from_stored(base.registry_version(), base.stored_nodes());

        let (delta_log, replayed) = DeltaLog::open(&dir.join("delta.bin"))?;
        let mut delta_index = DeltaIndex::default();
        let mut skipped = 0_u64;
        for rec in &replayed {
            // Replay never resurrects edges for nodes the stored registry
            // does not know, and never admits weights outside [0, 1].
            let weight_ok = rec.weight.is_finite() && (0.0..=1.0).contains(&rec.weight);
            if weight_ok && registry.contains(rec.sender) && registry.contains(rec.receiver) {
                delta_index.apply(rec);
            } else {
                skipped += 1;
            }
        }
        if skipped > 0 {
            warn!(skipped, "delta records failed validation on replay and were ignored");
        }
        // Ticks must stay monotonic across restarts, including the case
        // where the delta was just consolidated away and only base records
        // carry the newest stamps.
        let resume_tick = delta_index.max_tick().unwrap_or(0).max(base.max_tick()?);

        Ok((
            Self {
                base,
                delta_log,
                delta_index,
                cache: HybridCache::new(cfg),
                registry,
                prune_threshold: cfg.prune_threshold,
                degraded: false,
            },
            resume_tick,
        ))
    }

    #[inline]
    pub(crate) fn registry(&self) -> &InnateRegistry {
        &self.registry
    }

    #[inline]
    pub(crate) fn degraded(&self) -> bool {
        self.degraded
    }

    pub(crate) fn node_count(&self) -> usize {
        self.base.node_count()
    }

    pub(crate) fn chunk_count(&self) -> usize {
        self.base.chunk_count()
    }

    pub(crate) fn delta_records(&self) -> u64 {
        self.delta_log.len()
    }

    pub(crate) fn delta_entries(&self) -> usize {
        self.delta_index.entries()
    }

    pub(crate) fn delta_senders(&self) -> usize {
        self.delta_index.sender_count()
    }

    pub(crate) fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub(crate) fn check_node(&self, id: NodeId, role: &'static str) -> Result<()> {
        if self.registry.contains(id) {
            Ok(())
        } else {
            Err(EngineError::UnknownNode { id, role })
        }
    }

    /// Effective out-degree including pending delta entries; Hebbian
    /// formation uses this for the per-node cap.
    pub(crate) fn out_degree_estimate(&self, sender: NodeId) -> u32 {
        self.base
            .out_degree(sender)
            .saturating_add(self.delta_index.entries_for(sender) as u32)
    }

    // ------------------------------------------------------------------
    // READ PATH (graph view)
    // ------------------------------------------------------------------

    /// Effective outgoing synapses for `sender`, sorted by receiver.
    pub(crate) fn outgoing(&mut self, sender: NodeId) -> Result<Vec<SynapseRec>> {
        self.check_node(sender, "sender")?;
        self.cache.record_access(sender);

        let base_list = match self.cache.get(sender) {
            Some(list) => list,
            None => {
                let loaded = match self.base.read_outgoing(sender) {
                    Ok(list) => list,
                    Err(e @ EngineError::StorageIo { .. }) => {
                        self.degraded = true;
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                };
                self.cache.insert(sender, loaded.clone());
                loaded
            }
        };

        let mut merged: BTreeMap<NodeId, (f32, Tick)> = base_list
            .iter()
            .map(|s| (s.receiver, (s.weight, s.tick)))
            .collect();
        if let Some(overlay) = self.delta_index.for_sender(sender) {
            for (receiver, (weight, tick)) in overlay {
                match merged.get(receiver) {
                    Some((_, base_tick)) if *base_tick > *tick => {}
                    _ => {
                        merged.insert(*receiver, (*weight, *tick));
                    }
                }
            }
        }

        Ok(merged
            .into_iter()
            .filter(|(_, (weight, _))| *weight != 0.0)
            .map(|(receiver, (weight, tick))| SynapseRec { receiver, weight, tick })
            .collect())
    }

    /// Adjacency snapshot over every registered sender: the substrate the
    /// shard actors spread on until the next consolidation.
    pub(crate) fn snapshot_adjacency(&mut self) -> Result<HashMap<NodeId, Vec<SynapseRec>>> {
        let ids = self.registry.sorted_ids();
        let mut adjacency = HashMap::with_capacity(ids.len());
        for id in ids {
            adjacency.insert(id, self.outgoing(id)?);
        }
        Ok(adjacency)
    }

    // ------------------------------------------------------------------
    // WRITE PATH
    // ------------------------------------------------------------------

    /// Record one edge update in the delta and invalidate the cache entry.
    pub(crate) fn update_edge(
        &mut self,
        sender: NodeId,
        receiver: NodeId,
        weight: f32,
        tick: Tick,
    ) -> Result<()> {
        self.check_node(sender, "sender")?;
        self.check_node(receiver, "receiver")?;

        let rec = DeltaRecord { sender, receiver, weight, tick };
        if let Err(e) = self.delta_log.append(&rec) {
            self.degraded = true;
            return Err(e);
        }
        self.delta_index.apply(&rec);
        self.cache.invalidate(sender);
        Ok(())
    }

    /// Force the delta log to disk (explicit flush surface).
    pub(crate) fn sync_delta(&mut self) -> Result<()> {
        self.delta_log.sync()
    }

    /// Pin a sender's adjacency into the cache hot tier.
    pub(crate) fn pin(&mut self, sender: NodeId) -> Result<()> {
        self.check_node(sender, "sender")?;
        self.cache.pin(sender);
        Ok(())
    }

    /// Release an explicit pin.
    pub(crate) fn unpin(&mut self, sender: NodeId) -> Result<()> {
        self.check_node(sender, "sender")?;
        self.cache.unpin(sender);
        Ok(())
    }

    // ------------------------------------------------------------------
    // CONSOLIDATION
    // ------------------------------------------------------------------

    /// Merge the delta into the base: last-write-wins by tick, tombstones
    /// remove edges, weights below the prune threshold are dropped. The
    /// delta is truncated only after the new base is durable, so a crash
    /// mid-merge leaves a replayable log behind.
    pub(crate) fn consolidate(&mut self) -> Result<MergeStats> {
        // fsync boundary: pending appends become durable before the merge.
        self.delta_log.sync()?;

        let mut stats = MergeStats::default();
        let mut rewrite: BTreeMap<NodeId, Vec<SynapseRec>> = BTreeMap::new();

        let mut senders = self.delta_index.senders();
        senders.sort_unstable();
        for sender in senders {
            let mut merged: BTreeMap<NodeId, (f32, Tick)> = self
                .base
                .read_outgoing(sender)?
                .into_iter()
                .map(|s| (s.receiver, (s.weight, s.tick)))
                .collect();
            if let Some(overlay) = self.delta_index.for_sender(sender) {
                for (receiver, (weight, tick)) in overlay {
                    match merged.get(receiver) {
                        Some((_, base_tick)) if *base_tick > *tick => {}
                        _ => {
                            merged.insert(*receiver, (*weight, *tick));
                            stats.merged += 1;
                        }
                    }
                }
            }

            let before = merged.len();
            let kept: Vec<SynapseRec> = merged
                .into_iter()
                .filter(|(_, (weight, _))| *weight != 0.0 && *weight >= self.prune_threshold)
                .map(|(receiver, (weight, tick))| SynapseRec { receiver, weight, tick })
                .collect();
            stats.pruned += (before - kept.len()) as u32;
            stats.senders += 1;
            rewrite.insert(sender, kept);
        }

        self.base.rewrite_senders(rewrite)?;
        self.delta_log.truncate()?;
        self.delta_index.clear();

        // The cache may hold pre-merge lists; drop everything and re-warm
        // the hot set from the new base.
        self.cache.purge();
        self.cache.refresh_budget();
        let warm = self.cache.pinned_ids();
        for id in warm {
            if self.registry.contains(id) {
                let list = self.base.read_outgoing(id)?;
                self.cache.insert(id, list);
            }
        }

        info!(
            merged = stats.merged,
            pruned = stats.pruned,
            senders = stats.senders,
            "consolidation merged delta into base"
        );
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // REGISTRY MIGRATION / BOOTSTRAP
    // ------------------------------------------------------------------

    /// Replace the registry, preserving edges whose endpoints survive.
    ///
    /// Aborts with `MigrationConflict` (old state intact) when an
    /// explicitly pinned node is absent from the new registry.
    pub(crate) fn migrate_registry(&mut self, next: InnateRegistry) -> Result<(u32, u32)> {
        for pinned in self.cache.explicit_pins() {
            if !next.contains(pinned) {
                return Err(EngineError::MigrationConflict { id: pinned });
            }
        }

        // Capture the effective graph (base + delta) before the old state
        // is torn down.
        let old_ids = self.registry.sorted_ids();
        let mut surviving: BTreeMap<NodeId, Vec<SynapseRec>> = BTreeMap::new();
        for sender in &old_ids {
            if !next.contains(*sender) {
                continue;
            }
            let list: Vec<SynapseRec> = self
                .outgoing(*sender)?
                .into_iter()
                .filter(|s| next.contains(s.receiver))
                .collect();
            surviving.insert(*sender, list);
        }
        for id in next.sorted_ids() {
            surviving.entry(id).or_default();
        }

        let kinds: HashMap<NodeId, NodeKind> = next.iter().collect();
        self.base.write_full(&surviving, &kinds, next.version())?;
        self.delta_log.truncate()?;
        self.delta_index.clear();
        self.cache.reset();
        self.cache.refresh_budget();

        let removed = old_ids.iter().filter(|id| !next.contains(**id)).count() as u32;
        let added = next
            .sorted_ids()
            .iter()
            .filter(|id| !self.registry.contains(**id))
            .count() as u32;
        self.registry = next;

        info!(added, removed, version = self.registry.version(), "registry migrated");
        Ok((added, removed))
    }

    /// Seed an empty store: every registered node gets an empty adjacency.
    pub(crate) fn bootstrap(&mut self, registry: InnateRegistry) -> Result<()> {
        let data: BTreeMap<NodeId, Vec<SynapseRec>> = registry
            .sorted_ids()
            .into_iter()
            .map(|id| (id, Vec::new()))
            .collect();
        let kinds: HashMap<NodeId, NodeKind> = registry.iter().collect();
        self.base.write_full(&data, &kinds, registry.version())?;
        self.delta_log.truncate()?;
        self.delta_index.clear();
        self.cache.reset();
        self.registry = registry;
        info!(nodes = self.registry.len(), "node pool initialized with empty adjacency");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn purge_cache_for_test(&mut self) {
        self.cache.purge();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NodeSpec;
    use tempfile::TempDir;

    fn open_seeded(dir: &Path, ids: &[NodeId]) -> GraphStore {
        let cfg = EngineConfig::default();
        let (mut store, _) = GraphStore::open(dir, &cfg).unwrap();
        let specs: Vec<NodeSpec> = ids.iter().map(|id| NodeSpec::from(*id)).collect();
        store.bootstrap(InnateRegistry::from_specs(1, &specs)).unwrap();
        store
    }

    #[test]
    fn unknown_sender_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = open_seeded(dir.path(), &[1, 2, 3]);
        assert!(matches!(
            store.outgoing(9),
            Err(EngineError::UnknownNode { id: 9, .. })
        ));
        assert!(store.update_edge(1, 9, 0.5, 1).is_err());
        assert!(store.update_edge(9, 1, 0.5, 1).is_err());
    }

    #[test]
    fn delta_overlays_base_last_write_wins() {
        let dir = TempDir::new().unwrap();
        let mut store = open_seeded(dir.path(), &[1, 2, 3]);

        store.update_edge(1, 2, 0.5, 1).unwrap();
        store.update_edge(1, 3, 0.3, 2).unwrap();
        store.consolidate().unwrap();

        // Newer delta entry shadows the consolidated base entry.
        store.update_edge(1, 2, 0.8, 3).unwrap();
        let view = store.outgoing(1).unwrap();
        assert_eq!(
            view,
            vec![
                SynapseRec { receiver: 2, weight: 0.8, tick: 3 },
                SynapseRec { receiver: 3, weight: 0.3, tick: 2 },
            ]
        );
    }

    #[test]
    fn zero_weight_is_a_tombstone_in_the_view_and_on_consolidate() {
        let dir = TempDir::new().unwrap();
        let mut store = open_seeded(dir.path(), &[1, 2]);

        store.update_edge(1, 2, 0.5, 1).unwrap();
        store.consolidate().unwrap();
        store.update_edge(1, 2, 0.0, 2).unwrap();

        assert_eq!(store.outgoing(1).unwrap(), vec![]);
        store.consolidate().unwrap();
        assert_eq!(store.outgoing(1).unwrap(), vec![]);
        assert_eq!(store.delta_records(), 0);
    }

    #[test]
    fn consolidate_is_a_fixpoint_for_the_view() {
        let dir = TempDir::new().unwrap();
        let mut store = open_seeded(dir.path(), &[1, 2, 3]);
        store.update_edge(1, 2, 0.5, 1).unwrap();
        store.update_edge(1, 3, 0.9, 2).unwrap();

        let before = store.outgoing(1).unwrap();
        store.consolidate().unwrap();
        let after = store.outgoing(1).unwrap();
        assert_eq!(before, after);
        assert_eq!(store.delta_records(), 0);
        assert_eq!(store.delta_entries(), 0);
    }

    #[test]
    fn consolidate_twice_yields_byte_equal_files() {
        let dir = TempDir::new().unwrap();
        let mut store = open_seeded(dir.path(), &[1, 2, 3]);
        store.update_edge(1, 2, 0.5, 1).unwrap();
        store.update_edge(2, 3, 0.4, 2).unwrap();
        store.consolidate().unwrap();

        let manifest_1 = std::fs::read(dir.path().join("base.bin")).unwrap();
        let chunk_1 = std::fs::read(dir.path().join("base_000000_000099.bin")).unwrap();

        // No intervening writes: nothing to merge, files must not change.
        store.consolidate().unwrap();
        let manifest_2 = std::fs::read(dir.path().join("base.bin")).unwrap();
        let chunk_2 = std::fs::read(dir.path().join("base_000000_000099.bin")).unwrap();
        assert_eq!(manifest_1, manifest_2);
        assert_eq!(chunk_1, chunk_2);
        assert_eq!(
            std::fs::metadata(dir.path().join("delta.bin")).unwrap().len(),
            0
        );
    }

    #[test]
    fn cache_is_transparent_to_the_view() {
        let dir = TempDir::new().unwrap();
        let mut store = open_seeded(dir.path(), &[1, 2, 3]);
        store.update_edge(1, 2, 0.5, 1).unwrap();
        store.consolidate().unwrap();
        store.update_edge(1, 3, 0.2, 2).unwrap();

        let warm = store.outgoing(1).unwrap(); // populates cache
        let warm_again = store.outgoing(1).unwrap(); // cache hit
        store.purge_cache_for_test();
        let cold = store.outgoing(1).unwrap(); // disk read
        assert_eq!(warm, warm_again);
        assert_eq!(warm, cold);
    }

    #[test]
    fn replay_restores_the_same_logical_graph() {
        let dir = TempDir::new().unwrap();
        let view_before;
        {
            let mut store = open_seeded(dir.path(), &[1, 2, 3]);
            store.update_edge(1, 2, 0.5, 1).unwrap();
            store.update_edge(1, 2, 0.7, 2).unwrap();
            store.update_edge(2, 3, 0.4, 3).unwrap();
            store.sync_delta().unwrap();
            view_before = store.outgoing(1).unwrap();
            // Dropped without consolidating: simulated crash.
        }

        let cfg = EngineConfig::default();
        let (mut store, resume_tick) = GraphStore::open(dir.path(), &cfg).unwrap();
        assert_eq!(store.outgoing(1).unwrap(), view_before);
        assert_eq!(store.delta_records(), 3);
        // The engine resumes at the newest persisted stamp.
        assert_eq!(resume_tick, 3);
    }

    #[test]
    fn migration_prunes_edges_outside_the_new_registry() {
        let dir = TempDir::new().unwrap();
        let mut store = open_seeded(dir.path(), &[1, 2, 3]);
        store.update_edge(1, 2, 0.5, 1).unwrap();
        store.update_edge(1, 3, 0.6, 2).unwrap();
        store.update_edge(3, 1, 0.4, 3).unwrap();

        // Node 3 disappears in version 2; its edges must go with it.
        let next = InnateRegistry::from_specs(2, &[NodeSpec::from(1_u64), NodeSpec::from(2_u64), NodeSpec::from(4_u64)]);
        let (added, removed) = store.migrate_registry(next).unwrap();
        assert_eq!((added, removed), (1, 1));
        assert_eq!(
            store.outgoing(1).unwrap(),
            vec![SynapseRec { receiver: 2, weight: 0.5, tick: 1 }]
        );
        assert!(store.outgoing(3).is_err());
        assert_eq!(store.outgoing(4).unwrap(), vec![]);
        assert_eq!(store.delta_records(), 0);
        assert_eq!(store.registry().version(), 2);
    }

    #[test]
    fn migration_conflict_on_pinned_node_keeps_old_state() {
        let dir = TempDir::new().unwrap();
        let mut store = open_seeded(dir.path(), &[1, 2, 3]);
        store.update_edge(1, 3, 0.6, 1).unwrap();
        store.pin(3).unwrap();

        let next = InnateRegistry::from_specs(2, &[NodeSpec::from(1_u64), NodeSpec::from(2_u64)]);
        assert!(matches!(
            store.migrate_registry(next),
            Err(EngineError::MigrationConflict { id: 3 })
        ));
        // Old state intact.
        assert_eq!(store.registry().version(), 1);
        assert_eq!(store.outgoing(1).unwrap().len(), 1);
    }
}
