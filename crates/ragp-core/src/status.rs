//! Read-only status surface: aggregated cache, runtime and storage counters.

use serde::Serialize;

use crate::cache::CacheStats;
use crate::runtime::MetricsSnapshot;

/// Runtime block of the status surface
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    /// True while the shard runtime is up
    pub async_on: bool,
    /// Shard count (configured default while the runtime is down)
    pub shards: usize,
    /// Live counters
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
}

impl RuntimeStatus {
    pub(crate) fn offline(shards: usize) -> Self {
        Self {
            async_on: false,
            shards,
            metrics: MetricsSnapshot {
                global_queue_len: 0,
                per_shard_queue_len: Vec::new(),
                per_shard_processed: Vec::new(),
                processed_total: 0,
                processed_per_sec: 0.0,
                dropped_total: 0,
                coalesced_total: 0,
                hop_total: 0,
                guard_mode: Default::default(),
                ingress_paused: false,
            },
        }
    }
}

/// Full engine status
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    /// Registered nodes
    pub nodes: usize,
    /// Chunk files on disk
    pub chunks: usize,
    /// Records in the delta log
    pub delta_records: u64,
    /// Distinct pending `(sender, receiver)` slots
    pub delta_entries: usize,
    /// Senders with pending delta entries
    pub delta_senders: usize,
    /// Nodes with non-zero activation
    pub active_nodes: usize,
    /// Global tick
    pub tick: u32,
    /// Registry version embedded in storage
    pub registry_version: u16,
    /// True after a storage I/O failure; reads may still serve from cache
    pub degraded: bool,
    /// Cache tier counters
    pub cache: CacheStats,
    /// Runtime counters
    pub runtime: RuntimeStatus,
}

/// Consolidation outcome
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ConsolidateReport {
    /// Delta entries folded into the base
    pub merged: u32,
    /// Edges removed by tombstones or the prune threshold
    pub pruned: u32,
    /// Senders rewritten
    pub senders: u32,
    /// Stimuli buffered during the barrier and replayed afterwards
    pub replayed_stimuli: u64,
}

/// Registry reconciliation outcome
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MigrationReport {
    /// True when storage was rewritten
    pub migrated: bool,
    /// Registry version now in force
    pub registry_version: u16,
    /// Nodes added by the migration
    pub added: u32,
    /// Nodes removed by the migration
    pub removed: u32,
}
