//! Shard actor: single consumer over one partition of the node space.
//!
//! A shard owns the activation slice for every node with
//! `owner_shard(node) == shard_id` and a read-only adjacency snapshot
//! shared by all shards until the next consolidation rebuild. Work runs to
//! completion between messages; the only suspension point is the inbox
//! receive. Writes for a sender always execute on its owner shard, which is
//! what serializes them without a global lock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::graph::GraphStore;
use crate::kernel::{ActivationKernel, KernelParams};
use crate::registry::{NodeId, Tick};
use crate::runtime::metrics::RuntimeMetrics;
use crate::storage::SynapseRec;

/// Adjacency snapshot the shards spread on
pub(crate) type Adjacency = HashMap<NodeId, Vec<SynapseRec>>;

/// Owner partition of a node
#[inline]
pub(crate) fn owner_shard(node: NodeId, shard_count: usize) -> usize {
    if shard_count == 0 {
        0
    } else {
        (node as usize) % shard_count
    }
}

// ============================================================================
// MESSAGES
// ============================================================================

/// Inbox protocol of a shard actor
pub(crate) enum ShardMsg {
    /// External ingress; the owner shard injects and spreads.
    Stimulus {
        node: NodeId,
        strength: f32,
        source: String,
        ts: DateTime<Utc>,
        ack: oneshot::Sender<bool>,
    },
    /// Cross-shard propagation; applied additively, re-spread over threshold.
    Hop {
        from: NodeId,
        to: NodeId,
        contribution: f32,
        ttl: u8,
    },
    /// Serialized write path for one sender.
    UpdateEdge {
        sender: NodeId,
        receiver: NodeId,
        weight: f32,
        tick: Tick,
        ack: oneshot::Sender<bool>,
    },
    /// Barrier: the shard has drained its inbox up to this point.
    Flush { ack: oneshot::Sender<()> },
    /// Swap in a fresh adjacency snapshot and reset activation state.
    Rebuild {
        adjacency: Arc<Adjacency>,
        ack: oneshot::Sender<()>,
    },
    /// Dump the shard's activation slice.
    ReadActivation {
        ack: oneshot::Sender<Vec<(NodeId, f32)>>,
    },
    /// Graceful shutdown.
    Stop,
}

/// Per-shard tunables
#[derive(Debug, Clone, Copy)]
pub(crate) struct ShardParams {
    pub(crate) kernel: KernelParams,
    pub(crate) spread_threshold: f32,
    pub(crate) hop_ttl: u8,
    pub(crate) hebbian_baseline: f32,
    pub(crate) max_synapses_per_node: u32,
}

// ============================================================================
// ACTOR LOOP
// ============================================================================

pub(crate) async fn shard_loop(
    shard_id: usize,
    mut rx: mpsc::UnboundedReceiver<ShardMsg>,
    peers: Vec<mpsc::UnboundedSender<ShardMsg>>,
    mut adjacency: Arc<Adjacency>,
    store: Arc<Mutex<GraphStore>>,
    metrics: Arc<RuntimeMetrics>,
    tick: Arc<AtomicU32>,
    params: ShardParams,
) {
    let shard_count = peers.len();
    let mut kernel = ActivationKernel::new(params.kernel);

    while let Some(msg) = rx.recv().await {
        match msg {
            ShardMsg::Stimulus { node, strength, source, ts, ack } => {
                metrics.dequeue(shard_id);
                let now = tick.fetch_add(1, Ordering::SeqCst).saturating_add(1);
                debug!(shard = shard_id, node, strength, source = %source, ts = %ts, "stimulus");
                kernel.inject(node, strength, now);
                spread(
                    shard_id,
                    shard_count,
                    &mut kernel,
                    &adjacency,
                    &peers,
                    &metrics,
                    node,
                    params.hop_ttl,
                    &params,
                    now,
                );
                learn(shard_id, &mut kernel, &store, &params, now);
                kernel.decay();
                metrics.set_active(shard_id, kernel.active_count() as u64);
                metrics.processed(shard_id);
                let _ = ack.send(true);
            }
            ShardMsg::Hop { from, to, contribution, ttl } => {
                metrics.dequeue(shard_id);
                let now = tick.load(Ordering::SeqCst);
                let level = kernel.inject(to, contribution, now);
                debug!(shard = shard_id, from, to, contribution, ttl, "hop applied");
                if ttl > 0 && level >= params.spread_threshold {
                    spread(
                        shard_id,
                        shard_count,
                        &mut kernel,
                        &adjacency,
                        &peers,
                        &metrics,
                        to,
                        ttl,
                        &params,
                        now,
                    );
                }
                metrics.set_active(shard_id, kernel.active_count() as u64);
                metrics.processed(shard_id);
            }
            ShardMsg::UpdateEdge { sender, receiver, weight, tick: at, ack } => {
                metrics.dequeue(shard_id);
                let ok = {
                    let mut guard = store.lock().unwrap();
                    match guard.update_edge(sender, receiver, weight, at) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(shard = shard_id, sender, receiver, error = %e, "edge update failed");
                            false
                        }
                    }
                };
                metrics.processed(shard_id);
                let _ = ack.send(ok);
            }
            ShardMsg::Flush { ack } => {
                let _ = ack.send(());
            }
            ShardMsg::Rebuild { adjacency: next, ack } => {
                adjacency = next;
                kernel.clear();
                metrics.set_active(shard_id, 0);
                let _ = ack.send(());
            }
            ShardMsg::ReadActivation { ack } => {
                let _ = ack.send(kernel.active_nodes());
            }
            ShardMsg::Stop => break,
        }
    }
}

/// One spread step from `seed`: contributions to locally owned receivers
/// are applied in place (and may cascade, ttl permitting); contributions to
/// foreign receivers leave as `Hop` messages.
#[allow(clippy::too_many_arguments)]
fn spread(
    shard_id: usize,
    shard_count: usize,
    kernel: &mut ActivationKernel,
    adjacency: &Adjacency,
    peers: &[mpsc::UnboundedSender<ShardMsg>],
    metrics: &RuntimeMetrics,
    seed: NodeId,
    ttl: u8,
    params: &ShardParams,
    now: Tick,
) {
    let mut queue: VecDeque<(NodeId, u8)> = VecDeque::new();
    queue.push_back((seed, ttl));

    while let Some((node, ttl_left)) = queue.pop_front() {
        if ttl_left == 0 {
            continue;
        }
        let Some(edges) = adjacency.get(&node) else {
            continue;
        };
        let level = kernel.activation_of(node);
        for edge in edges {
            let contribution = level * edge.weight;
            if contribution < params.kernel.epsilon {
                continue;
            }
            let target = owner_shard(edge.receiver, shard_count);
            if target == shard_id {
                let receiver_level = kernel.inject(edge.receiver, contribution, now);
                if receiver_level >= params.spread_threshold {
                    queue.push_back((edge.receiver, ttl_left - 1));
                }
            } else {
                metrics.hop();
                metrics.enqueue(target);
                let _ = peers[target].send(ShardMsg::Hop {
                    from: node,
                    to: edge.receiver,
                    contribution,
                    ttl: ttl_left - 1,
                });
            }
        }
    }
}

/// Hebbian step over the shard's temporal window. Every node in the window
/// is owned here, so the proposed writes are sender-serialized by
/// construction; the store mutex is held only for the short apply section.
fn learn(
    shard_id: usize,
    kernel: &mut ActivationKernel,
    store: &Arc<Mutex<GraphStore>>,
    params: &ShardParams,
    now: Tick,
) {
    let proposals = kernel.hebbian_proposals(1.0);
    if proposals.is_empty() {
        return;
    }

    let mut guard = store.lock().unwrap();
    let mut current: HashMap<NodeId, HashMap<NodeId, f32>> = HashMap::new();
    for p in proposals {
        let slots = match current.entry(p.sender) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let outgoing = match guard.outgoing(p.sender) {
                    Ok(list) => list,
                    Err(e2) => {
                        warn!(shard = shard_id, sender = p.sender, error = %e2, "hebbian read failed");
                        continue;
                    }
                };
                e.insert(outgoing.into_iter().map(|s| (s.receiver, s.weight)).collect())
            }
        };

        let next_weight = match slots.get(&p.receiver) {
            Some(weight) => (weight + p.delta_w).clamp(0.0, 1.0),
            None => {
                if guard.out_degree_estimate(p.sender) >= params.max_synapses_per_node {
                    continue;
                }
                params.hebbian_baseline
            }
        };
        slots.insert(p.receiver, next_weight);
        if let Err(e) = guard.update_edge(p.sender, p.receiver, next_weight, now) {
            warn!(shard = shard_id, sender = p.sender, receiver = p.receiver, error = %e, "hebbian write failed");
        }
    }
}
