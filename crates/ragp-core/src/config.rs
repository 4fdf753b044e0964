//! Engine configuration.
//!
//! Every knob has a default that matches the shipped deployment profile and
//! an optional environment override under the `RAGP_` prefix. Construction
//! is builder-style; [`EngineConfig::validate`] rejects out-of-range numeric
//! settings before the engine touches disk.

use std::collections::HashMap;
use std::env;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::registry::NodeId;

// ============================================================================
// DEFAULTS
// ============================================================================

/// Fraction of available RAM the cache may use
pub const DEFAULT_CACHE_RAM_FRACTION: f32 = 0.25;
/// Lower bound of the cache budget, in MiB
pub const DEFAULT_CACHE_RAM_MIN_MB: u64 = 256;
/// Upper bound of the cache budget, in MiB
pub const DEFAULT_CACHE_RAM_MAX_MB: u64 = 1536;
/// Fraction of the budget reserved for the pinned tier
pub const DEFAULT_CACHE_PIN_FRACTION: f32 = 0.35;
/// Registry version assumed when none is configured
pub const DEFAULT_INNATE_REGISTRY_VERSION: u16 = 1;
/// Largest node id the registry is expected to hand us
pub const DEFAULT_NODE_MAX: u64 = 220;
/// Senders per synapse chunk file
pub const DEFAULT_CHUNK_SPAN: u32 = 100;
/// Multiplicative activation decay per tick
pub const DEFAULT_DECAY_GAMMA: f32 = 0.90;
/// Activations below this are dropped from the map
pub const DEFAULT_ACTIVATION_EPSILON: f32 = 1e-4;
/// Minimum incoming contribution that re-spreads a node
pub const DEFAULT_SPREAD_THRESHOLD: f32 = 0.2;
/// Cross-shard hop budget for one spread
pub const DEFAULT_HOP_TTL: u8 = 4;
/// Temporal window capacity (Hebbian substrate)
pub const DEFAULT_TEMPORAL_WINDOW: usize = 5;
/// Hebbian learning rate
pub const DEFAULT_HEBBIAN_ETA: f32 = 0.1;
/// Weight assigned to a freshly formed synapse
pub const DEFAULT_HEBBIAN_BASELINE: f32 = 0.01;
/// Out-degree cap enforced during formation
pub const DEFAULT_MAX_SYNAPSES_PER_NODE: u32 = 7_000;
/// Edges below this weight are dropped at consolidation
pub const DEFAULT_PRUNE_THRESHOLD: f32 = 0.005;
/// Action candidates returned by `compute_cd`
pub const DEFAULT_CD_TOP_K: usize = 16;
/// Queue length that escalates guard mode
pub const DEFAULT_QUEUE_HIGH_WATER: u64 = 8_192;
/// Queue length that reverts guard mode to normal
pub const DEFAULT_QUEUE_LOW_WATER: u64 = 1_024;

// ============================================================================
// POLICY ENUMS
// ============================================================================

/// Cache replacement policy. Only `pinned_lru` is currently implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Pinned hot set plus LRU of recent senders
    #[default]
    PinnedLru,
}

impl CachePolicy {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        "pinned_lru"
    }

    /// Parse from string name; unknown names fall back to the default.
    pub fn parse_name(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "pinned_lru" | "lru" => CachePolicy::PinnedLru,
            other => {
                tracing::warn!(policy = other, "unknown cache policy, using pinned_lru");
                CachePolicy::PinnedLru
            }
        }
    }
}

/// How repeated `(node, source)` stimuli inside one batch are merged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CoalesceStrategy {
    /// Keep the strongest contribution
    #[default]
    Max,
    /// Add contributions together (clamped downstream)
    Sum,
    /// Keep the most recent contribution
    Last,
}

impl CoalesceStrategy {
    /// Merge a new strength into an existing coalesced slot
    pub fn merge(&self, current: f32, incoming: f32) -> f32 {
        match self {
            CoalesceStrategy::Max => current.max(incoming),
            CoalesceStrategy::Sum => current + incoming,
            CoalesceStrategy::Last => incoming,
        }
    }
}

/// Cost term subtracted from each action candidate in `compute_cd`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "model")]
pub enum CostModel {
    /// Flat cost for every action
    Constant {
        /// The cost
        cost: f64,
    },
    /// Per-action table with a fallback for unlisted actions
    PerAction {
        /// Action id → cost
        costs: HashMap<NodeId, f64>,
        /// Cost applied when an action is not in the table
        default: f64,
    },
    /// Mean outgoing weight of the action node (1.0 when it has no edges)
    OutgoingMean,
}

impl Default for CostModel {
    fn default() -> Self {
        CostModel::Constant { cost: 0.0 }
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

/// Full engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Wipe the storage directory on boot
    pub reset_storage: bool,
    /// Cache replacement policy
    pub cache_policy: CachePolicy,
    /// Fraction of available RAM usable by the cache
    pub cache_ram_fraction: f32,
    /// Hard lower bound on the cache budget (MiB)
    pub cache_ram_min_mb: u64,
    /// Hard upper bound on the cache budget (MiB)
    pub cache_ram_max_mb: u64,
    /// Fraction of the budget reserved for the pinned tier
    pub cache_pin_fraction: f32,
    /// Configured registry version; a mismatch with storage triggers migration
    pub innate_registry_version: u16,
    /// Start the async runtime during `Engine::open`
    pub async_boot: bool,
    /// Largest node id accepted from the registry
    pub node_max: u64,
    /// Senders per chunk file
    pub chunk_span: u32,
    /// Multiplicative activation decay per tick, in (0, 1)
    pub decay_gamma: f32,
    /// Activation floor; entries below are removed
    pub activation_epsilon: f32,
    /// Minimum contribution that re-spreads a receiver
    pub spread_threshold: f32,
    /// Hop budget for one spread (cross-shard propagation)
    pub hop_ttl: u8,
    /// Temporal window capacity
    pub temporal_window: usize,
    /// Hebbian learning rate η
    pub hebbian_eta: f32,
    /// Baseline weight for freshly formed synapses
    pub hebbian_baseline: f32,
    /// Out-degree cap enforced during Hebbian formation
    pub max_synapses_per_node: u32,
    /// Consolidation prune threshold
    pub prune_threshold: f32,
    /// Batch coalescing strategy
    pub coalesce_strategy: CoalesceStrategy,
    /// Action cost model for `compute_cd`
    pub cost_model: CostModel,
    /// Action candidates returned by `compute_cd`
    pub cd_top_k: usize,
    /// Shard count for the async runtime; 0 means auto (half the cores, min 2)
    pub shard_count: usize,
    /// Queue length that escalates guard mode
    pub queue_high_water: u64,
    /// Queue length that reverts guard mode
    pub queue_low_water: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reset_storage: false,
            cache_policy: CachePolicy::PinnedLru,
            cache_ram_fraction: DEFAULT_CACHE_RAM_FRACTION,
            cache_ram_min_mb: DEFAULT_CACHE_RAM_MIN_MB,
            cache_ram_max_mb: DEFAULT_CACHE_RAM_MAX_MB,
            cache_pin_fraction: DEFAULT_CACHE_PIN_FRACTION,
            innate_registry_version: DEFAULT_INNATE_REGISTRY_VERSION,
            async_boot: false,
            node_max: DEFAULT_NODE_MAX,
            chunk_span: DEFAULT_CHUNK_SPAN,
            decay_gamma: DEFAULT_DECAY_GAMMA,
            activation_epsilon: DEFAULT_ACTIVATION_EPSILON,
            spread_threshold: DEFAULT_SPREAD_THRESHOLD,
            hop_ttl: DEFAULT_HOP_TTL,
            temporal_window: DEFAULT_TEMPORAL_WINDOW,
            hebbian_eta: DEFAULT_HEBBIAN_ETA,
            hebbian_baseline: DEFAULT_HEBBIAN_BASELINE,
            max_synapses_per_node: DEFAULT_MAX_SYNAPSES_PER_NODE,
            prune_threshold: DEFAULT_PRUNE_THRESHOLD,
            coalesce_strategy: CoalesceStrategy::Max,
            cost_model: CostModel::default(),
            cd_top_k: DEFAULT_CD_TOP_K,
            shard_count: 0,
            queue_high_water: DEFAULT_QUEUE_HIGH_WATER,
            queue_low_water: DEFAULT_QUEUE_LOW_WATER,
        }
    }
}

impl EngineConfig {
    /// Defaults with `RAGP_*` environment overrides applied
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.reset_storage = env_bool("RAGP_RESET_STORAGE", cfg.reset_storage);
        if let Ok(v) = env::var("RAGP_CACHE_POLICY") {
            cfg.cache_policy = CachePolicy::parse_name(&v);
        }
        cfg.cache_ram_fraction = env_f32("RAGP_CACHE_RAM_FRACTION", cfg.cache_ram_fraction);
        cfg.cache_ram_min_mb = env_u64("RAGP_CACHE_RAM_MIN_MB", cfg.cache_ram_min_mb);
        cfg.cache_ram_max_mb = env_u64("RAGP_CACHE_RAM_MAX_MB", cfg.cache_ram_max_mb);
        cfg.cache_pin_fraction = env_f32("RAGP_CACHE_PIN_FRACTION", cfg.cache_pin_fraction);
        cfg.innate_registry_version = env_u64("RAGP_INNATE_REGISTRY_VERSION", cfg.innate_registry_version as u64)
            .min(u16::MAX as u64) as u16;
        cfg.async_boot = env_bool("RAGP_ASYNC", cfg.async_boot);
        cfg.node_max = env_u64("RAGP_NODE_MAX", cfg.node_max);
        cfg
    }

    /// Effective shard count: the configured value, or half the cores (min 2)
    pub fn effective_shard_count(&self) -> usize {
        if self.shard_count > 0 {
            return self.shard_count.max(2);
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        (cpus / 2).max(2)
    }

    /// Reject out-of-range numeric settings.
    pub fn validate(&self) -> Result<()> {
        if !(self.decay_gamma > 0.0 && self.decay_gamma < 1.0) {
            return Err(EngineError::InvalidValue {
                what: "decay_gamma",
                value: self.decay_gamma as f64,
            });
        }
        if !(self.activation_epsilon > 0.0 && self.activation_epsilon.is_finite()) {
            return Err(EngineError::InvalidValue {
                what: "activation_epsilon",
                value: self.activation_epsilon as f64,
            });
        }
        for (what, v) in [
            ("cache_ram_fraction", self.cache_ram_fraction),
            ("cache_pin_fraction", self.cache_pin_fraction),
        ] {
            if !(v > 0.0 && v < 1.0) {
                return Err(EngineError::InvalidValue {
                    what,
                    value: v as f64,
                });
            }
        }
        if !self.spread_threshold.is_finite() || self.spread_threshold < 0.0 {
            return Err(EngineError::InvalidValue {
                what: "spread_threshold",
                value: self.spread_threshold as f64,
            });
        }
        if self.hop_ttl == 0 {
            return Err(EngineError::InvalidValue {
                what: "hop_ttl",
                value: 0.0,
            });
        }
        if self.temporal_window == 0 {
            return Err(EngineError::InvalidValue {
                what: "temporal_window",
                value: 0.0,
            });
        }
        if self.chunk_span == 0 {
            return Err(EngineError::InvalidValue {
                what: "chunk_span",
                value: 0.0,
            });
        }
        if self.queue_low_water >= self.queue_high_water {
            return Err(EngineError::InvalidValue {
                what: "queue_low_water",
                value: self.queue_low_water as f64,
            });
        }
        Ok(())
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_f32(key: &str, default: f32) -> f32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<f32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn decay_outside_unit_interval_is_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.decay_gamma = 1.0;
        assert!(matches!(
            cfg.validate(),
            Err(EngineError::InvalidValue { what: "decay_gamma", .. })
        ));
        cfg.decay_gamma = f32::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn watermarks_must_be_ordered() {
        let mut cfg = EngineConfig::default();
        cfg.queue_low_water = cfg.queue_high_water;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn coalesce_strategies_merge() {
        assert_eq!(CoalesceStrategy::Max.merge(0.2, 0.5), 0.5);
        assert_eq!(CoalesceStrategy::Sum.merge(0.2, 0.5), 0.7);
        assert_eq!(CoalesceStrategy::Last.merge(0.2, 0.5), 0.5);
        assert_eq!(CoalesceStrategy::Last.merge(0.5, 0.2), 0.2);
    }

    #[test]
    fn unknown_cache_policy_falls_back() {
        assert_eq!(CachePolicy::parse_name("arc"), CachePolicy::PinnedLru);
        assert_eq!(CachePolicy::parse_name("PINNED_LRU"), CachePolicy::PinnedLru);
    }
}
