//! Activation kernel: single-step spreading state and Hebbian substrate.
//!
//! The kernel is deliberately single-threaded; the engine wraps one for the
//! synchronous path and every shard actor owns one for the nodes in its
//! partition. Per tick the order of operations is ingest → spread → score →
//! learn → decay, all sharing the same monotonic global tick.

use std::collections::{HashMap, VecDeque};

use crate::registry::{NodeId, Tick};

/// One proposed Hebbian edge update
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct HebbianProposal {
    pub(crate) sender: NodeId,
    pub(crate) receiver: NodeId,
    /// Weight increment for an existing edge; new edges start at baseline.
    pub(crate) delta_w: f32,
}

/// Tunables the kernel needs per step
#[derive(Debug, Clone, Copy)]
pub(crate) struct KernelParams {
    /// Multiplicative decay per tick, in (0, 1)
    pub(crate) gamma: f32,
    /// Activations below this are dropped
    pub(crate) epsilon: f32,
    /// Co-activation threshold for Hebbian pairing
    pub(crate) threshold: f32,
    /// Hebbian learning rate η
    pub(crate) eta: f32,
    /// Temporal window capacity
    pub(crate) window: usize,
}

/// Shard- or engine-local activation state
#[derive(Debug)]
pub(crate) struct ActivationKernel {
    activation: HashMap<NodeId, f32>,
    temporal_window: VecDeque<(NodeId, f32, Tick)>,
    params: KernelParams,
}

impl ActivationKernel {
    pub(crate) fn new(params: KernelParams) -> Self {
        Self {
            activation: HashMap::new(),
            temporal_window: VecDeque::with_capacity(params.window),
            params,
        }
    }

    /// Add `strength` to a node's activation and record it in the temporal
    /// window. Window overflow drops the oldest entry; it never blocks.
    pub(crate) fn inject(&mut self, node: NodeId, strength: f32, tick: Tick) -> f32 {
        let slot = self.activation.entry(node).or_insert(0.0);
        *slot = (*slot + strength).clamp(0.0, f32::MAX);
        let level = *slot;
        self.temporal_window.push_back((node, level, tick));
        while self.temporal_window.len() > self.params.window {
            self.temporal_window.pop_front();
        }
        level
    }

    /// Current activation of a node
    #[inline]
    pub(crate) fn activation_of(&self, node: NodeId) -> f32 {
        self.activation.get(&node).copied().unwrap_or(0.0)
    }

    /// Snapshot of the activation map
    pub(crate) fn activation_map(&self) -> &HashMap<NodeId, f32> {
        &self.activation
    }

    /// Number of active nodes
    #[inline]
    pub(crate) fn active_count(&self) -> usize {
        self.activation.len()
    }

    /// Active nodes, strongest first; ties broken by smaller id.
    pub(crate) fn active_nodes(&self) -> Vec<(NodeId, f32)> {
        let mut out: Vec<(NodeId, f32)> = self.activation.iter().map(|(k, v)| (*k, *v)).collect();
        out.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        out
    }

    /// Multiplicative decay; entries falling below ε are removed.
    pub(crate) fn decay(&mut self) {
        let gamma = self.params.gamma;
        let epsilon = self.params.epsilon;
        self.activation.retain(|_, v| {
            *v *= gamma;
            *v >= epsilon
        });
    }

    /// Hebbian pairing over the temporal window: every ordered pair of
    /// distinct co-present nodes whose recorded activations clear the
    /// threshold yields `Δw = η · act_i · act_j · reward`.
    pub(crate) fn hebbian_proposals(&self, reward: f32) -> Vec<HebbianProposal> {
        let entries: Vec<(NodeId, f32)> = self
            .temporal_window
            .iter()
            .map(|(node, act, _)| (*node, *act))
            .collect();

        let mut proposals = Vec::new();
        for (i, (sender, act_i)) in entries.iter().enumerate() {
            if *act_i < self.params.threshold {
                continue;
            }
            for (j, (receiver, act_j)) in entries.iter().enumerate() {
                if i == j || sender == receiver || *act_j < self.params.threshold {
                    continue;
                }
                proposals.push(HebbianProposal {
                    sender: *sender,
                    receiver: *receiver,
                    delta_w: self.params.eta * act_i * act_j * reward,
                });
            }
        }
        proposals
    }

    /// Drop all activation state and the window (consolidation epoch).
    pub(crate) fn clear(&mut self) {
        self.activation.clear();
        self.temporal_window.clear();
    }

    #[cfg(test)]
    pub(crate) fn window_len(&self) -> usize {
        self.temporal_window.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> KernelParams {
        KernelParams {
            gamma: 0.5,
            epsilon: 0.01,
            threshold: 0.2,
            eta: 0.1,
            window: 3,
        }
    }

    #[test]
    fn inject_accumulates_and_tracks_window() {
        let mut k = ActivationKernel::new(params());
        assert_eq!(k.inject(1, 0.4, 0), 0.4);
        assert_eq!(k.inject(1, 0.3, 1), 0.7);
        assert_eq!(k.activation_of(1), 0.7);
        assert_eq!(k.active_count(), 1);
        assert_eq!(k.window_len(), 2);
    }

    #[test]
    fn window_overflow_drops_oldest_never_blocks() {
        let mut k = ActivationKernel::new(params());
        for node in 1..=10_u64 {
            k.inject(node, 0.5, node as Tick);
        }
        assert_eq!(k.window_len(), 3);
        // Only the three most recent nodes can pair.
        let senders: Vec<NodeId> = k
            .hebbian_proposals(1.0)
            .iter()
            .map(|p| p.sender)
            .collect();
        assert!(senders.iter().all(|s| *s >= 8));
    }

    #[test]
    fn decay_is_multiplicative_and_evicts_below_epsilon() {
        let mut k = ActivationKernel::new(params());
        k.inject(1, 0.8, 0);
        k.inject(2, 0.018, 0);
        k.decay();
        assert!((k.activation_of(1) - 0.4).abs() < 1e-6);
        // 0.018 * 0.5 = 0.009 < ε, removed entirely.
        assert_eq!(k.activation_of(2), 0.0);
        assert_eq!(k.active_count(), 1);
    }

    #[test]
    fn hebbian_pairs_need_both_sides_over_threshold() {
        let mut k = ActivationKernel::new(params());
        k.inject(1, 0.5, 0);
        k.inject(2, 0.1, 0); // below threshold
        k.inject(3, 0.4, 0);

        let proposals = k.hebbian_proposals(1.0);
        // Only (1,3) and (3,1) qualify.
        assert_eq!(proposals.len(), 2);
        for p in &proposals {
            assert!(p.sender != 2 && p.receiver != 2);
            assert!((p.delta_w - 0.1 * 0.5 * 0.4).abs() < 1e-6);
        }
    }

    #[test]
    fn reward_scales_proposals() {
        let mut k = ActivationKernel::new(params());
        k.inject(1, 0.5, 0);
        k.inject(3, 0.4, 0);
        let unit = k.hebbian_proposals(1.0)[0].delta_w;
        let doubled = k.hebbian_proposals(2.0)[0].delta_w;
        assert!((doubled - 2.0 * unit).abs() < 1e-6);
    }

    #[test]
    fn active_nodes_sorted_strongest_first_ties_by_id() {
        let mut k = ActivationKernel::new(params());
        k.inject(5, 0.4, 0);
        k.inject(2, 0.4, 0);
        k.inject(9, 0.9, 0);
        assert_eq!(k.active_nodes(), vec![(9, 0.9), (2, 0.4), (5, 0.4)]);
    }
}
