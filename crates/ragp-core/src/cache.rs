//! Hybrid synapse cache: pinned hot set plus LRU of recent senders.
//!
//! The cache is a performance layer only; the graph view must return
//! identical results whether or not a read hits it. Budgeting is adaptive:
//! `clamp(available_ram * ram_fraction, ram_min, ram_max)`, with a
//! configured fraction of that reserved for the pinned tier. Senders whose
//! access count keeps crossing the rebalance interval are promoted into the
//! pinned tier; explicitly pinned senders stay put until unpinned, budget
//! pressure, or a registry migration.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;

use lru::LruCache;
use serde::Serialize;
use sysinfo::System;

use crate::config::EngineConfig;
use crate::registry::NodeId;
use crate::storage::SynapseRec;

/// LRU slot count; the byte budget is the real bound, this caps key churn.
const LRU_SLOTS: usize = 1_000;
/// Accesses between pinned-set recomputations
const REBALANCE_ACCESS_INTERVAL: u32 = 500;
/// Fixed per-entry overhead added to the synapse-list estimate
const ENTRY_OVERHEAD_BYTES: u64 = 64;
/// Bytes per cached synapse record
const RECORD_BYTES: u64 = 16;

/// Cache counters for the status surface
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    /// Entries resident in the pinned tier
    pub pinned_nodes: usize,
    /// Entries resident in the LRU tier
    pub lru_nodes: usize,
    /// Current RAM budget, MiB
    pub cache_budget_mb: f64,
    /// Estimated resident bytes, MiB
    pub cache_bytes_est_mb: f64,
}

/// Two-tier bounded cache of base synapse lists
#[derive(Debug)]
pub(crate) struct HybridCache {
    lru: LruCache<NodeId, Vec<SynapseRec>>,
    pinned: HashMap<NodeId, Vec<SynapseRec>>,
    pinned_set: HashSet<NodeId>,
    explicit_pins: HashSet<NodeId>,
    access_count: HashMap<NodeId, u32>,
    accesses_since_rebalance: u32,

    ram_fraction: f32,
    ram_min_mb: u64,
    ram_max_mb: u64,
    pin_fraction: f32,

    budget_bytes: u64,
    pinned_budget_bytes: u64,
    lru_budget_bytes: u64,
    pinned_bytes_est: u64,
    lru_bytes_est: u64,
}

impl HybridCache {
    pub(crate) fn new(cfg: &EngineConfig) -> Self {
        let mut cache = Self {
            lru: LruCache::new(NonZeroUsize::new(LRU_SLOTS).unwrap()),
            pinned: HashMap::new(),
            pinned_set: HashSet::new(),
            explicit_pins: HashSet::new(),
            access_count: HashMap::new(),
            accesses_since_rebalance: 0,
            ram_fraction: cfg.cache_ram_fraction,
            ram_min_mb: cfg.cache_ram_min_mb,
            ram_max_mb: cfg.cache_ram_max_mb,
            pin_fraction: cfg.cache_pin_fraction,
            budget_bytes: 0,
            pinned_budget_bytes: 0,
            lru_budget_bytes: 0,
            pinned_bytes_est: 0,
            lru_bytes_est: 0,
        };
        cache.refresh_budget();
        cache
    }

    fn entry_bytes(list: &[SynapseRec]) -> u64 {
        (list.len() as u64) * RECORD_BYTES + ENTRY_OVERHEAD_BYTES
    }

    /// Recompute the RAM budget from current system memory.
    pub(crate) fn refresh_budget(&mut self) {
        let mut sys = System::new();
        sys.refresh_memory();
        let avail = sys.available_memory();

        let fraction = self.ram_fraction.clamp(0.01, 0.90) as f64;
        let min = self.ram_min_mb * 1024 * 1024;
        let max = (self.ram_max_mb * 1024 * 1024).max(min);
        self.budget_bytes = (((avail as f64) * fraction) as u64).clamp(min, max);

        let pin_fraction = self.pin_fraction.clamp(0.05, 0.90) as f64;
        self.pinned_budget_bytes = ((self.budget_bytes as f64) * pin_fraction) as u64;
        self.lru_budget_bytes = self.budget_bytes - self.pinned_budget_bytes;
        self.enforce_budget();
    }

    fn recount(&mut self) {
        self.pinned_bytes_est = self.pinned.values().map(|v| Self::entry_bytes(v)).sum();
        self.lru_bytes_est = self.lru.iter().map(|(_, v)| Self::entry_bytes(v)).sum();
    }

    fn enforce_budget(&mut self) {
        self.recount();
        while self.lru_bytes_est > self.lru_budget_bytes {
            match self.lru.pop_lru() {
                Some((_, v)) => self.lru_bytes_est -= Self::entry_bytes(&v).min(self.lru_bytes_est),
                None => break,
            }
        }
        while self.pinned_bytes_est > self.pinned_budget_bytes {
            let Some(victim) = self.lowest_scored_pinned() else {
                break;
            };
            if let Some(v) = self.pinned.remove(&victim) {
                self.pinned_bytes_est -= Self::entry_bytes(&v).min(self.pinned_bytes_est);
            }
            self.pinned_set.remove(&victim);
        }
    }

    /// Pin-worthiness: weighted blend of strongest outgoing edge and
    /// normalized access frequency.
    fn pin_score(&self, node: NodeId, list: &[SynapseRec], max_access: f32) -> f32 {
        let max_weight = list.iter().fold(0.0_f32, |acc, s| acc.max(s.weight));
        let access = self.access_count.get(&node).copied().unwrap_or(0) as f32;
        let access_norm = if max_access <= 0.0 { 0.0 } else { access / max_access };
        0.6 * max_weight + 0.4 * access_norm
    }

    /// Eviction candidate in the pinned tier. Explicit pins lose last.
    fn lowest_scored_pinned(&self) -> Option<NodeId> {
        let max_access = self.access_count.values().copied().max().unwrap_or(1) as f32;
        let mut pool: Vec<(NodeId, &Vec<SynapseRec>)> = self
            .pinned
            .iter()
            .filter(|(id, _)| !self.explicit_pins.contains(id))
            .map(|(id, v)| (*id, v))
            .collect();
        if pool.is_empty() {
            pool = self.pinned.iter().map(|(id, v)| (*id, v)).collect();
        }
        pool.into_iter()
            .min_by(|a, b| {
                let sa = self.pin_score(a.0, a.1, max_access);
                let sb = self.pin_score(b.0, b.1, max_access);
                sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(id, _)| id)
    }

    // ------------------------------------------------------------------
    // READ / WRITE
    // ------------------------------------------------------------------

    /// Look up a sender; LRU recency is updated on hit.
    pub(crate) fn get(&mut self, sender: NodeId) -> Option<Vec<SynapseRec>> {
        if let Some(v) = self.pinned.get(&sender) {
            return Some(v.clone());
        }
        self.lru.get(&sender).cloned()
    }

    /// Insert a freshly loaded synapse list into the right tier.
    pub(crate) fn insert(&mut self, sender: NodeId, list: Vec<SynapseRec>) {
        if self.pinned_set.contains(&sender) {
            self.pinned_bytes_est += Self::entry_bytes(&list);
            self.pinned.insert(sender, list);
        } else {
            self.lru_bytes_est += Self::entry_bytes(&list);
            self.lru.put(sender, list);
        }
        self.enforce_budget();
    }

    /// Record an access; periodically refresh the budget and the pinned set.
    ///
    /// Returns `true` when a rebalance happened (callers may re-warm).
    pub(crate) fn record_access(&mut self, sender: NodeId) -> bool {
        let slot = self.access_count.entry(sender).or_insert(0);
        *slot = slot.saturating_add(1);
        self.accesses_since_rebalance += 1;
        if self.accesses_since_rebalance >= REBALANCE_ACCESS_INTERVAL {
            self.accesses_since_rebalance = 0;
            self.refresh_budget();
            self.rebalance_pinned();
            return true;
        }
        false
    }

    /// Drop the cached entry for a sender (write path).
    pub(crate) fn invalidate(&mut self, sender: NodeId) {
        self.pinned.remove(&sender);
        self.lru.pop(&sender);
        self.recount();
    }

    /// Drop everything, keeping access statistics and explicit pins.
    pub(crate) fn purge(&mut self) {
        self.pinned.clear();
        self.lru.clear();
        self.pinned_bytes_est = 0;
        self.lru_bytes_est = 0;
    }

    /// Full reset, including statistics and pins (registry migration).
    pub(crate) fn reset(&mut self) {
        self.purge();
        self.pinned_set.clear();
        self.explicit_pins.clear();
        self.access_count.clear();
        self.accesses_since_rebalance = 0;
    }

    /// Explicitly pin a sender into the hot tier.
    pub(crate) fn pin(&mut self, sender: NodeId) {
        self.explicit_pins.insert(sender);
        self.pinned_set.insert(sender);
        if let Some(v) = self.lru.pop(&sender) {
            self.pinned.insert(sender, v);
            self.recount();
        }
    }

    /// Release an explicit pin; the entry moves back under LRU policy.
    pub(crate) fn unpin(&mut self, sender: NodeId) {
        self.explicit_pins.remove(&sender);
        self.pinned_set.remove(&sender);
        if let Some(v) = self.pinned.remove(&sender) {
            self.lru.put(sender, v);
            self.recount();
        }
    }

    /// Explicitly pinned senders (migration arbitration reads these)
    pub(crate) fn explicit_pins(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.explicit_pins.iter().copied()
    }

    /// Senders currently marked hot; used to re-warm after a purge.
    pub(crate) fn pinned_ids(&self) -> Vec<NodeId> {
        self.pinned_set.iter().copied().collect()
    }

    /// Recompute which senders deserve the pinned tier, by score, greedily
    /// under the pinned byte budget. Explicit pins are always kept.
    fn rebalance_pinned(&mut self) {
        let max_access = self.access_count.values().copied().max().unwrap_or(1) as f32;

        let mut scored: Vec<(NodeId, f32, u64)> = Vec::new();
        for (id, list) in self.pinned.iter() {
            scored.push((*id, self.pin_score(*id, list, max_access), Self::entry_bytes(list)));
        }
        for (id, list) in self.lru.iter() {
            scored.push((*id, self.pin_score(*id, list, max_access), Self::entry_bytes(list)));
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut next: HashSet<NodeId> = self.explicit_pins.clone();
        let mut used: u64 = 0;
        for (id, _, bytes) in scored {
            if next.contains(&id) {
                continue;
            }
            if used + bytes <= self.pinned_budget_bytes {
                next.insert(id);
                used += bytes;
            }
        }

        // Demote entries that fell out, promote entries that made it.
        let demoted: Vec<NodeId> = self
            .pinned
            .keys()
            .copied()
            .filter(|id| !next.contains(id))
            .collect();
        for id in demoted {
            if let Some(v) = self.pinned.remove(&id) {
                self.lru.put(id, v);
            }
        }
        for id in next.iter() {
            if !self.pinned.contains_key(id) {
                if let Some(v) = self.lru.pop(id) {
                    self.pinned.insert(*id, v);
                }
            }
        }
        self.pinned_set = next;
        self.enforce_budget();
    }

    /// Status counters
    pub(crate) fn stats(&self) -> CacheStats {
        const MB: f64 = 1024.0 * 1024.0;
        CacheStats {
            pinned_nodes: self.pinned.len(),
            lru_nodes: self.lru.len(),
            cache_budget_mb: self.budget_bytes as f64 / MB,
            cache_bytes_est_mb: (self.pinned_bytes_est + self.lru_bytes_est) as f64 / MB,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> HybridCache {
        HybridCache::new(&EngineConfig::default())
    }

    fn list(receivers: &[NodeId]) -> Vec<SynapseRec> {
        receivers
            .iter()
            .map(|r| SynapseRec { receiver: *r, weight: 0.5, tick: 1 })
            .collect()
    }

    #[test]
    fn insert_then_get_roundtrips() {
        let mut c = cache();
        c.insert(1, list(&[2, 3]));
        assert_eq!(c.get(1).unwrap().len(), 2);
        assert!(c.get(2).is_none());
        assert_eq!(c.stats().lru_nodes, 1);
    }

    #[test]
    fn invalidate_drops_both_tiers() {
        let mut c = cache();
        c.insert(1, list(&[2]));
        c.pin(3);
        c.insert(3, list(&[4]));
        assert_eq!(c.stats().pinned_nodes, 1);

        c.invalidate(1);
        c.invalidate(3);
        assert!(c.get(1).is_none());
        assert!(c.get(3).is_none());
    }

    #[test]
    fn pinned_entries_survive_lru_churn() {
        let mut c = cache();
        c.pin(7);
        c.insert(7, list(&[1]));
        for id in 100..100 + (LRU_SLOTS as u64) + 10 {
            c.insert(id, list(&[1]));
        }
        assert!(c.get(7).is_some());
    }

    #[test]
    fn unpin_moves_entry_to_lru_tier() {
        let mut c = cache();
        c.pin(7);
        c.insert(7, list(&[1, 2]));
        assert_eq!(c.stats().pinned_nodes, 1);

        c.unpin(7);
        let stats = c.stats();
        assert_eq!(stats.pinned_nodes, 0);
        assert_eq!(stats.lru_nodes, 1);
        assert!(c.get(7).is_some());
    }

    #[test]
    fn purge_keeps_pin_membership_reset_clears_it() {
        let mut c = cache();
        c.pin(7);
        c.insert(7, list(&[1]));
        c.purge();
        assert!(c.get(7).is_none());
        assert_eq!(c.pinned_ids(), vec![7]);

        c.reset();
        assert!(c.pinned_ids().is_empty());
        assert_eq!(c.explicit_pins().count(), 0);
    }

    #[test]
    fn budget_is_clamped_between_min_and_max() {
        let cfg = EngineConfig::default();
        let c = cache();
        let min = cfg.cache_ram_min_mb * 1024 * 1024;
        let max = cfg.cache_ram_max_mb * 1024 * 1024;
        assert!(c.budget_bytes >= min && c.budget_bytes <= max);
    }
}
