//! Sharded asynchronous activation runtime.
//!
//! N single-consumer actors own disjoint partitions of the node space
//! (`owner_shard(node) = node mod shard_count`). The front-end here is
//! lock-light: guard mode and counters live in atomics, and the only lock
//! is the small buffer that holds stimuli arriving while a consolidation
//! barrier has ingress paused (those are replayed after the rebuild, not
//! lost). Per-shard inboxes are FIFO; the `Flush` barrier is the only
//! cross-shard ordering point.

pub(crate) mod metrics;
pub(crate) mod shard;

use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::config::{CoalesceStrategy, EngineConfig};
use crate::error::{EngineError, Result};
use crate::graph::GraphStore;
use crate::kernel::KernelParams;
use crate::registry::{NodeId, Tick};

pub use metrics::{GuardMode, MetricsSnapshot};
pub(crate) use metrics::RuntimeMetrics;
pub(crate) use shard::{owner_shard, Adjacency, ShardMsg, ShardParams};

// ============================================================================
// INGRESS TYPES
// ============================================================================

/// One stimulus as submitted by an external producer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StimulusInput {
    /// Target node
    pub node: NodeId,
    /// Contribution in `[0, 1]`
    pub strength: f32,
    /// Producer tag used for coalescing, e.g. `"mic"`
    pub source: String,
    /// Producer-side timestamp
    pub ts: DateTime<Utc>,
}

impl StimulusInput {
    /// Stimulus stamped with the current wall clock
    pub fn now(node: NodeId, strength: f32, source: impl Into<String>) -> Self {
        Self {
            node,
            strength,
            source: source.into(),
            ts: Utc::now(),
        }
    }
}

/// Outcome of a batched submission
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BatchOutcome {
    /// Stimuli that reached their owner shard
    pub accepted: u64,
    /// Stimuli refused by guard mode
    pub rejected: u64,
    /// Duplicates merged before routing
    pub coalesced: u64,
}

/// Tunables accepted by `start_async_runtime`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RuntimeOptions {
    /// Shard count; 0 means the engine default
    pub shards: usize,
    /// Queue length that escalates guard mode
    pub high_water: u64,
    /// Queue length that reverts guard mode
    pub low_water: u64,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            shards: 0,
            high_water: crate::config::DEFAULT_QUEUE_HIGH_WATER,
            low_water: crate::config::DEFAULT_QUEUE_LOW_WATER,
        }
    }
}

// ============================================================================
// RUNTIME HANDLE
// ============================================================================

struct PendingStimulus {
    node: NodeId,
    strength: f32,
    source: String,
    ts: DateTime<Utc>,
}

/// Handle over the running shard actors
pub(crate) struct ShardRuntime {
    rt: tokio::runtime::Runtime,
    txs: Vec<mpsc::UnboundedSender<ShardMsg>>,
    metrics: Arc<RuntimeMetrics>,
    shard_count: usize,
    coalesce: CoalesceStrategy,
    /// Stimuli that arrived while ingress was paused by a barrier
    pending: Mutex<Vec<PendingStimulus>>,
    /// Pause gate: submitters hold a read side across check-and-send, the
    /// barrier takes the write side, so no stimulus straddles a pause.
    gate: std::sync::RwLock<()>,
}

impl ShardRuntime {
    /// Spawn the shard actors over an adjacency snapshot.
    pub(crate) fn start(
        store: Arc<Mutex<GraphStore>>,
        cfg: &EngineConfig,
        opts: RuntimeOptions,
        tick: Arc<AtomicU32>,
    ) -> Result<Self> {
        let shard_count = if opts.shards > 0 {
            opts.shards.max(2)
        } else {
            cfg.effective_shard_count()
        };

        let adjacency: Arc<Adjacency> = {
            let mut guard = store.lock().unwrap();
            Arc::new(guard.snapshot_adjacency()?)
        };

        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(shard_count.max(2))
            .thread_name("ragp-shard")
            .enable_all()
            .build()
            .map_err(|e| EngineError::io("building shard runtime", e))?;

        let metrics = Arc::new(RuntimeMetrics::new(
            shard_count,
            opts.high_water,
            opts.low_water,
        ));
        let params = ShardParams {
            kernel: KernelParams {
                gamma: cfg.decay_gamma,
                epsilon: cfg.activation_epsilon,
                threshold: cfg.spread_threshold,
                eta: cfg.hebbian_eta,
                window: cfg.temporal_window,
            },
            spread_threshold: cfg.spread_threshold,
            hop_ttl: cfg.hop_ttl,
            hebbian_baseline: cfg.hebbian_baseline,
            max_synapses_per_node: cfg.max_synapses_per_node,
        };

        let mut txs = Vec::with_capacity(shard_count);
        let mut rxs = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            let (tx, rx) = mpsc::unbounded_channel();
            txs.push(tx);
            rxs.push(rx);
        }
        for (shard_id, rx) in rxs.into_iter().enumerate() {
            rt.spawn(shard::shard_loop(
                shard_id,
                rx,
                txs.clone(),
                Arc::clone(&adjacency),
                Arc::clone(&store),
                Arc::clone(&metrics),
                Arc::clone(&tick),
                params,
            ));
        }

        info!(shards = shard_count, "async runtime started");
        Ok(Self {
            rt,
            txs,
            metrics,
            shard_count,
            coalesce: cfg.coalesce_strategy,
            pending: Mutex::new(Vec::new()),
            gate: std::sync::RwLock::new(()),
        })
    }

    #[inline]
    pub(crate) fn shard_count(&self) -> usize {
        self.shard_count
    }

    #[inline]
    pub(crate) fn metrics(&self) -> &Arc<RuntimeMetrics> {
        &self.metrics
    }

    pub(crate) fn set_watermarks(&self, high: u64, low: u64) {
        self.metrics.set_watermarks(high, low);
    }

    // ------------------------------------------------------------------
    // INGRESS
    // ------------------------------------------------------------------

    /// Route one stimulus to its owner shard and wait for the ack.
    ///
    /// While ingress is paused by a consolidation barrier the stimulus is
    /// buffered front-side and replayed after the rebuild. Under `drop`
    /// guard mode it is refused with `QueueFull`.
    pub(crate) fn submit(
        &self,
        node: NodeId,
        strength: f32,
        source: String,
        ts: DateTime<Utc>,
    ) -> Result<bool> {
        let _gate = self.gate.read().unwrap();
        if self.metrics.paused() {
            self.pending.lock().unwrap().push(PendingStimulus {
                node,
                strength,
                source,
                ts,
            });
            return Ok(true);
        }
        if self.metrics.refresh_guard() == GuardMode::Drop {
            self.metrics.dropped();
            return Err(EngineError::QueueFull { id: node });
        }

        let owner = owner_shard(node, self.shard_count);
        let (ack_tx, ack_rx) = oneshot::channel();
        self.metrics.enqueue(owner);
        if self
            .txs[owner]
            .send(ShardMsg::Stimulus {
                node,
                strength,
                source,
                ts,
                ack: ack_tx,
            })
            .is_err()
        {
            self.metrics.dequeue(owner);
            return Err(EngineError::RuntimeStopped);
        }
        Ok(self.rt.block_on(async { ack_rx.await.unwrap_or(false) }))
    }

    /// Coalesce a batch by `(node, source)` and route the survivors.
    pub(crate) fn submit_batch(&self, batch: Vec<StimulusInput>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut grouped: Vec<((NodeId, String), StimulusInput)> = Vec::new();
        let mut slots: HashMap<(NodeId, String), usize> = HashMap::new();

        for stim in batch {
            let key = (stim.node, stim.source.clone());
            match slots.get(&key) {
                Some(&i) => {
                    let merged = self.coalesce.merge(grouped[i].1.strength, stim.strength);
                    grouped[i].1.strength = merged;
                    grouped[i].1.ts = stim.ts;
                    outcome.coalesced += 1;
                }
                None => {
                    slots.insert(key.clone(), grouped.len());
                    grouped.push((key, stim));
                }
            }
        }
        self.metrics.coalesced(outcome.coalesced);

        // Owner-ordered routing keeps each shard's inbox bursts contiguous.
        grouped.sort_by_key(|((node, _), _)| owner_shard(*node, self.shard_count));
        for (_, stim) in grouped {
            match self.submit(stim.node, stim.strength.clamp(0.0, 1.0), stim.source, stim.ts) {
                Ok(true) => outcome.accepted += 1,
                Ok(false) | Err(_) => outcome.rejected += 1,
            }
        }
        outcome
    }

    // ------------------------------------------------------------------
    // WRITE PATH / BARRIER
    // ------------------------------------------------------------------

    /// Route an edge update through the sender's owner shard (total order
    /// per sender) and wait for it to be applied.
    pub(crate) fn route_update(
        &self,
        sender: NodeId,
        receiver: NodeId,
        weight: f32,
        tick: Tick,
    ) -> Result<()> {
        let owner = owner_shard(sender, self.shard_count);
        let (ack_tx, ack_rx) = oneshot::channel();
        self.metrics.enqueue(owner);
        if self
            .txs[owner]
            .send(ShardMsg::UpdateEdge {
                sender,
                receiver,
                weight,
                tick,
                ack: ack_tx,
            })
            .is_err()
        {
            self.metrics.dequeue(owner);
            return Err(EngineError::RuntimeStopped);
        }
        let ok = self.rt.block_on(async { ack_rx.await.unwrap_or(false) });
        if ok {
            Ok(())
        } else {
            Err(EngineError::io(
                format!("owner shard rejected edge update {sender}->{receiver}"),
                std::io::Error::from(std::io::ErrorKind::Other),
            ))
        }
    }

    /// Pause ingress; stimuli arriving after this buffer at the front-end.
    ///
    /// Returns only once no submit is mid-flight, so everything routed
    /// before the pause is visible to a subsequent flush barrier.
    pub(crate) fn pause_ingress(&self) {
        let _gate = self.gate.write().unwrap();
        self.metrics.set_paused(true);
    }

    /// Resume ingress and replay everything buffered during the barrier.
    pub(crate) fn resume_ingress(&self) -> u64 {
        self.metrics.set_paused(false);
        let held: Vec<PendingStimulus> = std::mem::take(&mut *self.pending.lock().unwrap());
        let mut replayed = 0;
        for stim in held {
            if self
                .submit(stim.node, stim.strength, stim.source, stim.ts)
                .is_ok()
            {
                replayed += 1;
            }
        }
        replayed
    }

    /// Barrier: every shard has drained its inbox up to the flush point.
    pub(crate) fn flush_all(&self) {
        let mut acks = Vec::with_capacity(self.txs.len());
        for tx in &self.txs {
            let (ack_tx, ack_rx) = oneshot::channel();
            if tx.send(ShardMsg::Flush { ack: ack_tx }).is_ok() {
                acks.push(ack_rx);
            }
        }
        self.rt.block_on(async {
            for ack in acks {
                let _ = ack.await;
            }
        });
    }

    /// Swap a fresh adjacency snapshot into every shard and reset their
    /// activation slices.
    pub(crate) fn rebuild_all(&self, adjacency: Arc<Adjacency>) {
        let mut acks = Vec::with_capacity(self.txs.len());
        for tx in &self.txs {
            let (ack_tx, ack_rx) = oneshot::channel();
            if tx
                .send(ShardMsg::Rebuild {
                    adjacency: Arc::clone(&adjacency),
                    ack: ack_tx,
                })
                .is_ok()
            {
                acks.push(ack_rx);
            }
        }
        self.rt.block_on(async {
            for ack in acks {
                let _ = ack.await;
            }
        });
    }

    /// Gather the activation slices of all shards, strongest first.
    pub(crate) fn read_activation(&self) -> Vec<(NodeId, f32)> {
        let mut acks = Vec::with_capacity(self.txs.len());
        for tx in &self.txs {
            let (ack_tx, ack_rx) = oneshot::channel();
            if tx.send(ShardMsg::ReadActivation { ack: ack_tx }).is_ok() {
                acks.push(ack_rx);
            }
        }
        let mut all: Vec<(NodeId, f32)> = self.rt.block_on(async {
            let mut out = Vec::new();
            for ack in acks {
                if let Ok(slice) = ack.await {
                    out.extend(slice);
                }
            }
            out
        });
        all.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        all
    }

    /// Graceful shutdown: every actor drains its inbox up to the `Stop`
    /// and exits; the tokio runtime tears down when the handle drops.
    pub(crate) fn halt(&self) {
        for tx in &self.txs {
            let _ = tx.send(ShardMsg::Stop);
        }
        info!("async runtime stopping");
    }
}
