//! Engine handle: the public surface over storage, cache, kernel and
//! runtime.
//!
//! One engine owns one storage directory (an OS-level lock file keeps a
//! second process out). All methods take `&self`; interior state sits
//! behind a small number of mutexes, so the handle can be shared across
//! threads. The synchronous spreading path works without the async
//! runtime; `submit_stimulus` and friends require it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::{CostModel, EngineConfig};
use crate::error::{check_finite, EngineError, Result};
use crate::graph::GraphStore;
use crate::kernel::{ActivationKernel, KernelParams};
use crate::registry::{InnateRegistry, NodeId, NodeSpec, Tick};
use crate::runtime::{
    Adjacency, BatchOutcome, RuntimeOptions, ShardRuntime, StimulusInput,
};
use crate::status::{ConsolidateReport, EngineStatus, MigrationReport, RuntimeStatus};
use crate::storage::{DirLock, SynapseRec};

/// Persistent activation-spreading graph engine
pub struct Engine {
    cfg: EngineConfig,
    dir: PathBuf,
    store: Arc<Mutex<GraphStore>>,
    kernel: Mutex<ActivationKernel>,
    runtime: Mutex<Option<Arc<ShardRuntime>>>,
    runtime_ever_started: AtomicBool,
    policy: Mutex<RuntimeOptions>,
    tick: Arc<AtomicU32>,
    consolidating: AtomicBool,
    _lock: DirLock,
}

impl Engine {
    /// Open an engine over `dir`, creating the directory as needed.
    ///
    /// Replays the delta log, rechunks a legacy monolithic base and, when
    /// configured, wipes the directory or boots the async runtime.
    pub fn open(dir: impl AsRef<Path>, cfg: EngineConfig) -> Result<Self> {
        cfg.validate()?;
        let dir = dir.as_ref().to_path_buf();

        if cfg.reset_storage && dir.exists() {
            warn!(dir = %dir.display(), "RESET_STORAGE set; wiping storage directory");
            std::fs::remove_dir_all(&dir)
                .map_err(|e| EngineError::io("wiping storage directory", e))?;
        }
        std::fs::create_dir_all(&dir)
            .map_err(|e| EngineError::io("creating storage directory", e))?;
        let lock = DirLock::acquire(&dir)?;

        let (store, resume_tick) = GraphStore::open(&dir, &cfg)?;
        let kernel = ActivationKernel::new(KernelParams {
            gamma: cfg.decay_gamma,
            epsilon: cfg.activation_epsilon,
            threshold: cfg.spread_threshold,
            eta: cfg.hebbian_eta,
            window: cfg.temporal_window,
        });

        let engine = Self {
            policy: Mutex::new(RuntimeOptions {
                shards: cfg.shard_count,
                high_water: cfg.queue_high_water,
                low_water: cfg.queue_low_water,
            }),
            dir,
            store: Arc::new(Mutex::new(store)),
            kernel: Mutex::new(kernel),
            runtime: Mutex::new(None),
            runtime_ever_started: AtomicBool::new(false),
            tick: Arc::new(AtomicU32::new(resume_tick)),
            consolidating: AtomicBool::new(false),
            _lock: lock,
            cfg,
        };

        info!(
            dir = %engine.dir.display(),
            nodes = engine.store.lock().unwrap().node_count(),
            tick = engine.tick.load(Ordering::SeqCst),
            "engine opened"
        );
        if engine.cfg.async_boot {
            engine.start_async_runtime(None)?;
        }
        Ok(engine)
    }

    /// Storage directory this engine owns
    pub fn storage_dir(&self) -> &Path {
        &self.dir
    }

    fn runtime_handle(&self) -> Option<Arc<ShardRuntime>> {
        self.runtime.lock().unwrap().clone()
    }

    fn require_runtime(&self) -> Result<Arc<ShardRuntime>> {
        match self.runtime_handle() {
            Some(rt) => Ok(rt),
            None if self.runtime_ever_started.load(Ordering::Acquire) => {
                Err(EngineError::RuntimeStopped)
            }
            None => Err(EngineError::RuntimeNotStarted),
        }
    }

    // ------------------------------------------------------------------
    // REGISTRY
    // ------------------------------------------------------------------

    /// Reconcile the innate registry with storage.
    ///
    /// A fresh store is seeded with empty adjacency for every node; a
    /// version or membership change migrates the persisted graph, pruning
    /// edges whose endpoints disappear. A no-op when nothing changed.
    pub fn ensure_innate_registry(&self, specs: &[NodeSpec]) -> Result<MigrationReport> {
        if specs.is_empty() {
            return Err(EngineError::InvalidValue {
                what: "registry specs",
                value: 0.0,
            });
        }
        for spec in specs {
            if spec.id > self.cfg.node_max {
                return Err(EngineError::InvalidValue {
                    what: "node id above NODE_MAX",
                    value: spec.id as f64,
                });
            }
        }
        let next = InnateRegistry::from_specs(self.cfg.innate_registry_version, specs);

        let report = {
            let mut store = self.store.lock().unwrap();
            let same_ids = store.registry().sorted_ids() == next.sorted_ids();
            let same_version = store.registry().version() == next.version();

            if store.node_count() == 0 {
                let added = next.len() as u32;
                store.bootstrap(next)?;
                MigrationReport {
                    migrated: true,
                    registry_version: store.registry().version(),
                    added,
                    removed: 0,
                }
            } else if same_ids && same_version {
                MigrationReport {
                    migrated: false,
                    registry_version: store.registry().version(),
                    added: 0,
                    removed: 0,
                }
            } else {
                let (added, removed) = store.migrate_registry(next)?;
                MigrationReport {
                    migrated: true,
                    registry_version: store.registry().version(),
                    added,
                    removed,
                }
            }
        };

        if report.migrated {
            self.kernel.lock().unwrap().clear();
            if let Some(rt) = self.runtime_handle() {
                // The shards' snapshot references dead nodes; rebuild it.
                rt.pause_ingress();
                rt.flush_all();
                let adjacency = self.snapshot_adjacency()?;
                rt.rebuild_all(adjacency);
                rt.resume_ingress();
            }
        }
        Ok(report)
    }

    // ------------------------------------------------------------------
    // READ PATH
    // ------------------------------------------------------------------

    /// Effective outgoing synapses of a sender, delta overlaid on base.
    pub fn get_connections(&self, sender: NodeId) -> Result<Vec<SynapseRec>> {
        self.store.lock().unwrap().outgoing(sender)
    }

    /// Activation readout, strongest first (runtime-aware).
    pub fn get_activation(&self) -> Vec<(NodeId, f32)> {
        if let Some(rt) = self.runtime_handle() {
            return rt.read_activation();
        }
        self.kernel.lock().unwrap().active_nodes()
    }

    /// Aggregated engine status
    pub fn status(&self) -> EngineStatus {
        let (nodes, chunks, delta_records, delta_entries, delta_senders, registry_version, degraded, cache) = {
            let store = self.store.lock().unwrap();
            (
                store.node_count(),
                store.chunk_count(),
                store.delta_records(),
                store.delta_entries(),
                store.delta_senders(),
                store.registry().version(),
                store.degraded(),
                store.cache_stats(),
            )
        };

        let (active_nodes, runtime) = match self.runtime_handle() {
            Some(rt) => (
                rt.metrics().active_total() as usize,
                RuntimeStatus {
                    async_on: true,
                    shards: rt.shard_count(),
                    metrics: rt.metrics().snapshot(),
                },
            ),
            None => (
                self.kernel.lock().unwrap().active_count(),
                RuntimeStatus::offline(self.cfg.effective_shard_count()),
            ),
        };

        EngineStatus {
            nodes,
            chunks,
            delta_records,
            delta_entries,
            delta_senders,
            active_nodes,
            tick: self.tick.load(Ordering::SeqCst),
            registry_version,
            degraded,
            cache,
            runtime,
        }
    }

    /// Runtime counters; fails when the runtime is down.
    pub fn get_async_metrics(&self) -> Result<RuntimeStatus> {
        let rt = self.require_runtime()?;
        rt.metrics().refresh_guard();
        Ok(RuntimeStatus {
            async_on: true,
            shards: rt.shard_count(),
            metrics: rt.metrics().snapshot(),
        })
    }

    // ------------------------------------------------------------------
    // SYNCHRONOUS ACTIVATION PATH
    // ------------------------------------------------------------------

    /// Inject a stimulus and spread it to completion on the calling
    /// thread. Fallback path when the async runtime is down.
    pub fn spread_activation(&self, node: NodeId, strength: f32) -> Result<()> {
        let strength = check_finite("strength", strength)?.clamp(0.0, 1.0);
        let mut store = self.store.lock().unwrap();
        store.check_node(node, "node")?;
        let mut kernel = self.kernel.lock().unwrap();

        let now = self.tick.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        kernel.inject(node, strength, now);

        let mut queue: std::collections::VecDeque<(NodeId, u8)> = std::collections::VecDeque::new();
        queue.push_back((node, self.cfg.hop_ttl));
        while let Some((current, ttl)) = queue.pop_front() {
            if ttl == 0 {
                continue;
            }
            let level = kernel.activation_of(current);
            for edge in store.outgoing(current)? {
                let contribution = level * edge.weight;
                if contribution < self.cfg.activation_epsilon {
                    continue;
                }
                let receiver_level = kernel.inject(edge.receiver, contribution, now);
                if receiver_level >= self.cfg.spread_threshold {
                    queue.push_back((edge.receiver, ttl - 1));
                }
            }
        }

        kernel.decay();
        Ok(())
    }

    /// Hebbian step over the temporal window: co-active pairs form new
    /// synapses at the baseline weight or reinforce existing ones by
    /// `η · act_i · act_j · reward`. Returns the number of edge updates.
    pub fn form_synapses_from_window(&self, reward: f32) -> Result<u32> {
        let reward = check_finite("reward", reward)?;
        let proposals = self.kernel.lock().unwrap().hebbian_proposals(reward);
        if proposals.is_empty() {
            return Ok(0);
        }

        let now = self.tick.load(Ordering::SeqCst);
        let mut store = self.store.lock().unwrap();
        let mut current: HashMap<NodeId, HashMap<NodeId, f32>> = HashMap::new();
        let mut updated = 0_u32;

        for p in proposals {
            if !store.registry().contains(p.sender) || !store.registry().contains(p.receiver) {
                continue;
            }
            if !current.contains_key(&p.sender) {
                let outgoing = store.outgoing(p.sender)?;
                current.insert(
                    p.sender,
                    outgoing.into_iter().map(|s| (s.receiver, s.weight)).collect(),
                );
            }
            let slots = current.get_mut(&p.sender).unwrap();

            let next_weight = match slots.get(&p.receiver) {
                Some(weight) => (weight + p.delta_w).clamp(0.0, 1.0),
                None => {
                    if store.out_degree_estimate(p.sender) >= self.cfg.max_synapses_per_node {
                        continue;
                    }
                    self.cfg.hebbian_baseline
                }
            };
            slots.insert(p.receiver, next_weight);
            store.update_edge(p.sender, p.receiver, next_weight, now)?;
            updated += 1;
        }
        Ok(updated)
    }

    /// Score action candidates against the current activation plus the
    /// supplied context nodes (treated as fully active). For each action:
    /// `cd = Σ incoming activation · weight − cost(action)`; the top-K
    /// survive, ties broken by smaller node id.
    pub fn compute_cd(&self, context: &[NodeId]) -> Result<Vec<(NodeId, f64)>> {
        let mut store = self.store.lock().unwrap();
        for ctx in context {
            store.check_node(*ctx, "context")?;
        }

        let actions = store.registry().action_ids();
        if actions.is_empty() {
            return Ok(Vec::new());
        }

        let mut sources: HashMap<NodeId, f32> = self.kernel.lock().unwrap().activation_map().clone();
        for ctx in context {
            let slot = sources.entry(*ctx).or_insert(0.0);
            *slot = slot.max(1.0);
        }

        let mut scores: HashMap<NodeId, f64> = actions.iter().map(|a| (*a, 0.0)).collect();
        for (src, act) in &sources {
            if !store.registry().contains(*src) {
                continue;
            }
            for edge in store.outgoing(*src)? {
                if let Some(score) = scores.get_mut(&edge.receiver) {
                    *score += (*act as f64) * (edge.weight as f64);
                }
            }
        }

        let mut out: Vec<(NodeId, f64)> = Vec::with_capacity(scores.len());
        for action in actions {
            let cost = match &self.cfg.cost_model {
                CostModel::Constant { cost } => *cost,
                CostModel::PerAction { costs, default } => {
                    costs.get(&action).copied().unwrap_or(*default)
                }
                CostModel::OutgoingMean => {
                    let outgoing = store.outgoing(action)?;
                    if outgoing.is_empty() {
                        1.0
                    } else {
                        outgoing.iter().map(|s| s.weight as f64).sum::<f64>()
                            / outgoing.len() as f64
                    }
                }
            };
            out.push((action, scores[&action] - cost));
        }

        out.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        out.truncate(self.cfg.cd_top_k);
        Ok(out)
    }

    // ------------------------------------------------------------------
    // WRITE PATH
    // ------------------------------------------------------------------

    /// Set an edge weight. With the runtime up the write is routed through
    /// the sender's owner shard, which totally orders updates per sender;
    /// otherwise it is applied inline. Weight 0 tombstones the edge.
    pub fn update_weight(&self, sender: NodeId, receiver: NodeId, weight: f32) -> Result<()> {
        let weight = check_finite("weight", weight)?.clamp(0.0, 1.0);
        {
            let store = self.store.lock().unwrap();
            store.check_node(sender, "sender")?;
            store.check_node(receiver, "receiver")?;
        }

        let at: Tick = self.tick.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        match self.runtime_handle() {
            Some(rt) => rt.route_update(sender, receiver, weight, at),
            None => self.store.lock().unwrap().update_edge(sender, receiver, weight, at),
        }
    }

    /// Pin a sender's adjacency into the cache hot tier.
    pub fn pin_node(&self, sender: NodeId) -> Result<()> {
        self.store.lock().unwrap().pin(sender)
    }

    /// Release an explicit cache pin.
    pub fn unpin_node(&self, sender: NodeId) -> Result<()> {
        self.store.lock().unwrap().unpin(sender)
    }

    /// Force pending delta appends to disk.
    pub fn flush_delta(&self) -> Result<()> {
        self.store.lock().unwrap().sync_delta()
    }

    // ------------------------------------------------------------------
    // ASYNC RUNTIME
    // ------------------------------------------------------------------

    /// Start the shard runtime over a fresh adjacency snapshot. Idempotent
    /// while already running.
    pub fn start_async_runtime(&self, opts: Option<RuntimeOptions>) -> Result<()> {
        let mut slot = self.runtime.lock().unwrap();
        if slot.is_some() {
            return Ok(());
        }
        let opts = opts.unwrap_or_else(|| *self.policy.lock().unwrap());
        if opts.low_water >= opts.high_water {
            return Err(EngineError::InvalidValue {
                what: "low_water",
                value: opts.low_water as f64,
            });
        }
        *self.policy.lock().unwrap() = opts;

        let rt = ShardRuntime::start(
            Arc::clone(&self.store),
            &self.cfg,
            opts,
            Arc::clone(&self.tick),
        )?;
        *slot = Some(Arc::new(rt));
        self.runtime_ever_started.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop the shard runtime; in-flight messages up to the `Stop` drain
    /// first. Subsequent async calls fail with `RuntimeStopped`.
    pub fn stop_async_runtime(&self) -> Result<()> {
        let taken = self.runtime.lock().unwrap().take();
        match taken {
            Some(rt) => {
                rt.halt();
                Ok(())
            }
            None if self.runtime_ever_started.load(Ordering::Acquire) => {
                Err(EngineError::RuntimeStopped)
            }
            None => Err(EngineError::RuntimeNotStarted),
        }
    }

    /// Adjust the backpressure policy. Watermarks apply immediately to a
    /// running runtime; a shard-count change takes effect at the next
    /// `start_async_runtime`.
    pub fn set_async_policy(&self, shards: usize, high_water: u64, low_water: u64) -> Result<()> {
        if low_water >= high_water {
            return Err(EngineError::InvalidValue {
                what: "low_water",
                value: low_water as f64,
            });
        }
        {
            let mut policy = self.policy.lock().unwrap();
            policy.shards = shards;
            policy.high_water = high_water;
            policy.low_water = low_water;
        }
        if let Some(rt) = self.runtime_handle() {
            rt.set_watermarks(high_water, low_water);
            if shards != 0 && shards != rt.shard_count() {
                warn!(
                    requested = shards,
                    current = rt.shard_count(),
                    "shard count change deferred until the runtime is restarted"
                );
            }
        }
        Ok(())
    }

    /// Submit one stimulus to the async runtime.
    ///
    /// Returns `Ok(true)` when the owner shard processed (or a barrier
    /// buffered) it. Under `drop` guard mode fails with `QueueFull`.
    pub fn submit_stimulus(
        &self,
        node: NodeId,
        strength: f32,
        source: impl Into<String>,
        ts: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let strength = check_finite("strength", strength)?.clamp(0.0, 1.0);
        self.store.lock().unwrap().check_node(node, "node")?;
        let rt = self.require_runtime()?;
        rt.submit(node, strength, source.into(), ts.unwrap_or_else(Utc::now))
    }

    /// Submit a batch, coalescing duplicate `(node, source)` pairs first.
    pub fn submit_stimuli(&self, batch: Vec<StimulusInput>) -> Result<BatchOutcome> {
        {
            let store = self.store.lock().unwrap();
            for stim in &batch {
                check_finite("strength", stim.strength)?;
                store.check_node(stim.node, "node")?;
            }
        }
        let rt = self.require_runtime()?;
        Ok(rt.submit_batch(batch))
    }

    // ------------------------------------------------------------------
    // CONSOLIDATION
    // ------------------------------------------------------------------

    /// Merge the delta into the base behind a full runtime barrier.
    ///
    /// Ingress pauses (stimuli buffer at the front-end), every shard acks a
    /// flush, the merge commits, shard snapshots are rebuilt from the new
    /// base, and only then does ingress resume and replay the buffer.
    /// Either the new base and the empty delta are both durable, or the
    /// pre-consolidation state is intact.
    pub fn consolidate(&self) -> Result<ConsolidateReport> {
        if self.consolidating.swap(true, Ordering::AcqRel) {
            return Err(EngineError::ConsolidateBusy);
        }
        let result = self.consolidate_inner();
        self.consolidating.store(false, Ordering::Release);
        result
    }

    fn consolidate_inner(&self) -> Result<ConsolidateReport> {
        let rt = self.runtime_handle();
        if let Some(rt) = &rt {
            rt.pause_ingress();
            rt.flush_all();
        }

        let merge_result = {
            let mut store = self.store.lock().unwrap();
            store.consolidate()
        };
        let merge = match merge_result {
            Ok(stats) => stats,
            Err(e) => {
                // Old base and un-truncated delta are intact; resume.
                if let Some(rt) = &rt {
                    rt.resume_ingress();
                }
                return Err(e);
            }
        };
        self.kernel.lock().unwrap().clear();

        let mut replayed = 0;
        if let Some(rt) = &rt {
            let adjacency = self.snapshot_adjacency()?;
            rt.rebuild_all(adjacency);
            replayed = rt.resume_ingress();
        }

        Ok(ConsolidateReport {
            merged: merge.merged,
            pruned: merge.pruned,
            senders: merge.senders,
            replayed_stimuli: replayed,
        })
    }

    fn snapshot_adjacency(&self) -> Result<Arc<Adjacency>> {
        let mut store = self.store.lock().unwrap();
        Ok(Arc::new(store.snapshot_adjacency()?))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(rt) = self.runtime.lock().unwrap().take() {
            rt.halt();
        }
        if let Ok(mut store) = self.store.lock() {
            let _ = store.sync_delta();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NodeKind;
    use tempfile::TempDir;

    /// Engine over a temp dir with registry `{1, 2, 3}` (3 is an action)
    fn test_engine() -> (Engine, TempDir) {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine
            .ensure_innate_registry(&[
                NodeSpec::new(1, NodeKind::Sensor),
                NodeSpec::new(2, NodeKind::Context),
                NodeSpec::new(3, NodeKind::Action),
            ])
            .unwrap();
        (engine, dir)
    }

    fn seeded_specs(ids: &[NodeId]) -> Vec<NodeSpec> {
        ids.iter().map(|id| NodeSpec::from(*id)).collect()
    }

    // ------------------------------------------------------------------
    // STORAGE SCENARIOS
    // ------------------------------------------------------------------

    #[test]
    fn cold_boot_empty_store() {
        let (engine, _dir) = test_engine();
        let status = engine.status();
        assert_eq!(status.nodes, 3);
        assert_eq!(status.chunks, 0);
        assert_eq!(status.delta_records, 0);
        assert_eq!(status.active_nodes, 0);
        assert_eq!(status.registry_version, 1);
        assert!(!status.degraded);
        assert!(!status.runtime.async_on);
    }

    #[test]
    fn write_then_reread_and_consolidate() {
        let (engine, dir) = test_engine();
        engine.update_weight(1, 2, 0.5).unwrap();
        assert_eq!(
            engine.get_connections(1).unwrap(),
            vec![SynapseRec { receiver: 2, weight: 0.5, tick: 1 }]
        );

        engine.consolidate().unwrap();
        assert_eq!(
            std::fs::metadata(dir.path().join("delta.bin")).unwrap().len(),
            0
        );
        assert_eq!(
            engine.get_connections(1).unwrap(),
            vec![SynapseRec { receiver: 2, weight: 0.5, tick: 1 }]
        );
    }

    #[test]
    fn crc_corruption_truncates_delta_on_restart() {
        let dir = TempDir::new().unwrap();
        {
            let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
            engine.ensure_innate_registry(&seeded_specs(&[1, 2, 3])).unwrap();
            engine.update_weight(1, 2, 0.4).unwrap();
            engine.update_weight(1, 3, 0.6).unwrap();
            engine.update_weight(2, 3, 0.8).unwrap();
            engine.flush_delta().unwrap();
        }

        // Flip a payload byte of the third record.
        let delta_path = dir.path().join("delta.bin");
        let mut bytes = std::fs::read(&delta_path).unwrap();
        let record_len = bytes.len() / 3;
        bytes[2 * record_len + 10] ^= 0xFF;
        std::fs::write(&delta_path, &bytes).unwrap();

        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        let status = engine.status();
        assert_eq!(status.delta_records, 2);
        assert_eq!(engine.get_connections(1).unwrap().len(), 2);
        assert_eq!(engine.get_connections(2).unwrap(), vec![]);
    }

    #[test]
    fn ticks_stay_monotonic_across_consolidate_and_restart() {
        let dir = TempDir::new().unwrap();
        {
            let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
            engine.ensure_innate_registry(&seeded_specs(&[1, 2])).unwrap();
            engine.update_weight(1, 2, 0.5).unwrap();
            engine.consolidate().unwrap();
        }

        // A write after restart must win the overlay against the
        // consolidated base record.
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.update_weight(1, 2, 0.8).unwrap();
        let view = engine.get_connections(1).unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].weight, 0.8);
        assert!(view[0].tick > 1);
    }

    #[test]
    fn reset_storage_wipes_previous_state() {
        let dir = TempDir::new().unwrap();
        {
            let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
            engine.ensure_innate_registry(&seeded_specs(&[1, 2])).unwrap();
            engine.update_weight(1, 2, 0.7).unwrap();
        }
        let cfg = EngineConfig {
            reset_storage: true,
            ..EngineConfig::default()
        };
        let engine = Engine::open(dir.path(), cfg).unwrap();
        assert_eq!(engine.status().nodes, 0);
    }

    #[test]
    fn registry_version_bump_migrates_and_prunes() {
        let dir = TempDir::new().unwrap();
        {
            let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
            engine.ensure_innate_registry(&seeded_specs(&[1, 2, 3])).unwrap();
            engine.update_weight(1, 2, 0.5).unwrap();
            engine.update_weight(1, 3, 0.9).unwrap();
        }

        let cfg = EngineConfig {
            innate_registry_version: 2,
            ..EngineConfig::default()
        };
        let engine = Engine::open(dir.path(), cfg).unwrap();
        let report = engine
            .ensure_innate_registry(&seeded_specs(&[1, 2, 4]))
            .unwrap();
        assert!(report.migrated);
        assert_eq!(report.registry_version, 2);
        assert_eq!(report.added, 1);
        assert_eq!(report.removed, 1);

        // Edge to the removed node 3 is gone; edge to 2 survives.
        assert_eq!(
            engine.get_connections(1).unwrap(),
            vec![SynapseRec { receiver: 2, weight: 0.5, tick: 1 }]
        );
        assert!(engine.get_connections(3).is_err());
        assert_eq!(engine.status().delta_records, 0);

        // Same registry again: no-op.
        let report = engine
            .ensure_innate_registry(&seeded_specs(&[1, 2, 4]))
            .unwrap();
        assert!(!report.migrated);
    }

    // ------------------------------------------------------------------
    // API BOUNDARIES
    // ------------------------------------------------------------------

    #[test]
    fn unknown_nodes_are_rejected_everywhere() {
        let (engine, _dir) = test_engine();
        assert!(matches!(
            engine.get_connections(99),
            Err(EngineError::UnknownNode { id: 99, .. })
        ));
        assert!(engine.spread_activation(99, 1.0).is_err());
        assert!(engine.update_weight(99, 1, 0.5).is_err());
        assert!(engine.update_weight(1, 99, 0.5).is_err());
        assert!(engine.compute_cd(&[99]).is_err());
        assert!(engine.pin_node(99).is_err());
    }

    #[test]
    fn non_finite_inputs_are_rejected() {
        let (engine, _dir) = test_engine();
        assert!(matches!(
            engine.update_weight(1, 2, f32::NAN),
            Err(EngineError::InvalidValue { .. })
        ));
        assert!(engine.spread_activation(1, f32::INFINITY).is_err());
        assert!(engine.form_synapses_from_window(f32::NAN).is_err());
    }

    #[test]
    fn weights_are_clamped_to_unit_interval() {
        let (engine, _dir) = test_engine();
        engine.update_weight(1, 2, 7.5).unwrap();
        assert_eq!(engine.get_connections(1).unwrap()[0].weight, 1.0);
    }

    #[test]
    fn async_ops_fail_before_start_and_after_stop() {
        let (engine, _dir) = test_engine();
        assert!(matches!(
            engine.submit_stimulus(1, 0.5, "test", None),
            Err(EngineError::RuntimeNotStarted)
        ));
        assert!(matches!(
            engine.get_async_metrics(),
            Err(EngineError::RuntimeNotStarted)
        ));

        engine.start_async_runtime(None).unwrap();
        assert!(engine.submit_stimulus(1, 0.5, "test", None).unwrap());
        engine.stop_async_runtime().unwrap();

        assert!(matches!(
            engine.submit_stimulus(1, 0.5, "test", None),
            Err(EngineError::RuntimeStopped)
        ));
        assert!(matches!(
            engine.stop_async_runtime(),
            Err(EngineError::RuntimeStopped)
        ));
    }

    // ------------------------------------------------------------------
    // ACTIVATION / LEARNING
    // ------------------------------------------------------------------

    #[test]
    fn spread_reaches_downstream_nodes() {
        let (engine, _dir) = test_engine();
        engine.update_weight(1, 2, 0.8).unwrap();
        engine.update_weight(2, 3, 0.9).unwrap();

        engine.spread_activation(1, 1.0).unwrap();
        let activation: HashMap<NodeId, f32> = engine.get_activation().into_iter().collect();
        assert!(activation[&1] > 0.0);
        assert!(activation[&2] > 0.0);
        // Two hops: 1 -> 2 -> 3.
        assert!(activation[&3] > 0.0);
    }

    #[test]
    fn decay_erases_activation_over_ticks() {
        let (engine, _dir) = test_engine();
        engine.spread_activation(1, 0.01).unwrap();
        // Repeated empty ingests decay the leftover activation to zero.
        for _ in 0..60 {
            engine.spread_activation(2, 0.0).unwrap();
        }
        let activation: HashMap<NodeId, f32> = engine.get_activation().into_iter().collect();
        assert!(!activation.contains_key(&1));
    }

    #[test]
    fn hebbian_formation_creates_and_reinforces_edges() {
        let (engine, _dir) = test_engine();
        engine.spread_activation(1, 1.0).unwrap();
        engine.spread_activation(2, 1.0).unwrap();

        let formed = engine.form_synapses_from_window(1.0).unwrap();
        assert!(formed > 0);
        let view = engine.get_connections(1).unwrap();
        let edge = view.iter().find(|s| s.receiver == 2).unwrap();
        assert_eq!(edge.weight, EngineConfig::default().hebbian_baseline);

        // Same window again: the fresh edge is reinforced past baseline.
        let reinforced = engine.form_synapses_from_window(1.0).unwrap();
        assert!(reinforced > 0);
        let view = engine.get_connections(1).unwrap();
        let edge = view.iter().find(|s| s.receiver == 2).unwrap();
        assert!(edge.weight > EngineConfig::default().hebbian_baseline);
        assert!(edge.weight <= 1.0);
    }

    #[test]
    fn registry_closure_and_weight_range_hold_after_learning() {
        let (engine, _dir) = test_engine();
        for _ in 0..5 {
            engine.spread_activation(1, 1.0).unwrap();
            engine.spread_activation(2, 0.9).unwrap();
            engine.spread_activation(3, 0.8).unwrap();
            engine.form_synapses_from_window(1.0).unwrap();
        }
        engine.consolidate().unwrap();

        for sender in [1_u64, 2, 3] {
            for edge in engine.get_connections(sender).unwrap() {
                assert!([1, 2, 3].contains(&edge.receiver), "edge outside registry");
                assert!((0.0..=1.0).contains(&edge.weight), "weight out of range");
            }
        }
    }

    #[test]
    fn compute_cd_scores_actions_and_breaks_ties_by_id() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine
            .ensure_innate_registry(&[
                NodeSpec::new(1, NodeKind::Sensor),
                NodeSpec::new(10, NodeKind::Context),
                NodeSpec::new(20, NodeKind::Action),
                NodeSpec::new(21, NodeKind::Action),
                NodeSpec::new(22, NodeKind::Action),
            ])
            .unwrap();

        engine.update_weight(10, 20, 0.4).unwrap();
        engine.update_weight(10, 21, 0.9).unwrap();
        engine.update_weight(1, 22, 0.4).unwrap();

        // Context 10 contributes at full strength; sensor 1 is inactive.
        let ranked = engine.compute_cd(&[10]).unwrap();
        assert_eq!(ranked[0].0, 21);
        assert!((ranked[0].1 - 0.9).abs() < 1e-6);
        // 20 scores 0.4; 22 scores 0.0; tie with nothing.
        assert_eq!(ranked[1].0, 20);
        assert_eq!(ranked[2].0, 22);

        // Equal evidence for 20 and 21: smaller id wins the tie.
        engine.update_weight(10, 20, 0.9).unwrap();
        let ranked = engine.compute_cd(&[10]).unwrap();
        assert_eq!(ranked[0].0, 20);
        assert_eq!(ranked[1].0, 21);
    }

    #[test]
    fn compute_cd_subtracts_configured_costs() {
        let dir = TempDir::new().unwrap();
        let mut costs = HashMap::new();
        costs.insert(21_u64, 0.5);
        let cfg = EngineConfig {
            cost_model: CostModel::PerAction { costs, default: 0.0 },
            ..EngineConfig::default()
        };
        let engine = Engine::open(dir.path(), cfg).unwrap();
        engine
            .ensure_innate_registry(&[
                NodeSpec::new(10, NodeKind::Context),
                NodeSpec::new(20, NodeKind::Action),
                NodeSpec::new(21, NodeKind::Action),
            ])
            .unwrap();
        engine.update_weight(10, 20, 0.4).unwrap();
        engine.update_weight(10, 21, 0.8).unwrap();

        // 21 would win on evidence, but its cost drags it under 20.
        let ranked = engine.compute_cd(&[10]).unwrap();
        assert_eq!(ranked[0].0, 20);
        assert!((ranked[1].1 - 0.3).abs() < 1e-6);
    }

    // ------------------------------------------------------------------
    // ASYNC RUNTIME SCENARIOS
    // ------------------------------------------------------------------

    fn async_engine(shards: usize) -> (Engine, TempDir) {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine
            .ensure_innate_registry(&seeded_specs(&[1, 2, 3, 5, 7, 9]))
            .unwrap();
        engine
            .start_async_runtime(Some(RuntimeOptions {
                shards,
                ..RuntimeOptions::default()
            }))
            .unwrap();
        (engine, dir)
    }

    #[test]
    fn sharded_ownership_routes_by_node_mod_shards() {
        let (engine, _dir) = async_engine(4);
        // 1, 5 and 9 are all owned by shard 1 (mod 4).
        for node in [1_u64, 5, 9] {
            assert!(engine.submit_stimulus(node, 1.0, "test", None).unwrap());
        }
        let metrics = engine.get_async_metrics().unwrap();
        assert_eq!(metrics.metrics.per_shard_processed[1], 3);
        assert_eq!(metrics.metrics.per_shard_processed[0], 0);
        assert_eq!(metrics.metrics.per_shard_processed[2], 0);
        assert_eq!(metrics.metrics.per_shard_processed[3], 0);
        engine.stop_async_runtime().unwrap();
    }

    #[test]
    fn batch_ingress_coalesces_duplicates() {
        let (engine, _dir) = async_engine(2);
        let batch = vec![
            StimulusInput::now(7, 0.2, "mic"),
            StimulusInput::now(7, 0.1, "mic"),
            StimulusInput::now(7, 0.15, "mic"),
        ];
        let outcome = engine.submit_stimuli(batch).unwrap();
        assert_eq!(outcome.accepted, 1);
        assert_eq!(outcome.coalesced, 2);
        assert_eq!(outcome.rejected, 0);

        // Max strategy keeps the strongest contribution; one decay step
        // has already run by the time we read it back.
        let activation: HashMap<NodeId, f32> = engine.get_activation().into_iter().collect();
        let expected = 0.2 * EngineConfig::default().decay_gamma;
        assert!((activation[&7] - expected).abs() < 1e-5);

        let metrics = engine.get_async_metrics().unwrap();
        assert_eq!(metrics.metrics.coalesced_total, 2);
        engine.stop_async_runtime().unwrap();
    }

    #[test]
    fn runtime_serializes_weight_updates_per_sender() {
        let (engine, _dir) = async_engine(4);
        for step in 1..=20_u32 {
            engine.update_weight(1, 2, step as f32 / 20.0).unwrap();
        }
        let view = engine.get_connections(1).unwrap();
        let edge = view.iter().find(|s| s.receiver == 2).unwrap();
        assert_eq!(edge.weight, 1.0);
        engine.stop_async_runtime().unwrap();
    }

    #[test]
    fn consolidate_drains_runtime_and_truncates_delta() {
        let (engine, dir) = async_engine(2);
        for i in 0..200_u64 {
            let node = [1_u64, 2, 3, 5, 7, 9][(i % 6) as usize];
            engine.submit_stimulus(node, 1.0, "load", None).unwrap();
        }
        engine.update_weight(1, 2, 0.66).unwrap();

        let report = engine.consolidate().unwrap();
        assert!(report.merged > 0);
        let status = engine.status();
        assert_eq!(status.delta_records, 0);
        assert_eq!(
            std::fs::metadata(dir.path().join("delta.bin")).unwrap().len(),
            0
        );

        // The pre-consolidation write is observable from the new base.
        let view = engine.get_connections(1).unwrap();
        let edge = view.iter().find(|s| s.receiver == 2).unwrap();
        assert_eq!(edge.weight, 0.66);

        // Post-barrier ingress works against the rebuilt snapshot.
        assert!(engine.submit_stimulus(1, 1.0, "after", None).unwrap());
        engine.stop_async_runtime().unwrap();
    }

    #[test]
    fn status_serializes_for_the_tool_surface() {
        let (engine, _dir) = test_engine();
        engine.update_weight(1, 2, 0.5).unwrap();

        let json = serde_json::to_value(engine.status()).unwrap();
        assert_eq!(json["nodes"], 3);
        assert_eq!(json["delta_records"], 1);
        assert_eq!(json["registry_version"], 1);
        assert_eq!(json["runtime"]["async_on"], false);
        assert_eq!(json["runtime"]["guard_mode"], "normal");
        assert!(json["cache"]["cache_budget_mb"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn second_engine_on_same_directory_is_locked_out() {
        let (engine, dir) = test_engine();
        assert!(Engine::open(dir.path(), EngineConfig::default()).is_err());
        drop(engine);
        assert!(Engine::open(dir.path(), EngineConfig::default()).is_ok());
    }
}
