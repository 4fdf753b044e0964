//! # RAGP Core
//!
//! Persistent, activation-spreading graph engine modeling a biologically
//! inspired associative memory: nodes are sensors, contexts and actions;
//! weighted directed synapses are learned associations. The engine ingests
//! stimuli, spreads activation across the graph, scores action candidates,
//! learns by Hebbian reinforcement and persists the evolving graph through
//! a chunked binary base plus an append-only delta log.
//!
//! ## Architecture
//!
//! - **Chunked base store**: `base.bin` manifest + fixed-width chunk files
//!   keyed by sender ranges; atomic rename rewrites, fsynced manifest.
//! - **Delta log**: append-only, CRC-protected `delta.bin`; replayed on
//!   boot, truncated at the first corrupt record, folded into the base by
//!   consolidation.
//! - **Hybrid cache**: pinned hot set + LRU of recent senders under an
//!   adaptive RAM budget.
//! - **Sharded actor runtime**: single-consumer inbox actors own disjoint
//!   node partitions; cross-shard propagation travels as ttl-bounded hop
//!   messages, writes are serialized by the sender's owner shard, and a
//!   flush barrier quiesces the whole runtime for consolidation.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ragp_core::{Engine, EngineConfig, NodeKind, NodeSpec};
//!
//! let engine = Engine::open("ragp_storage", EngineConfig::default())?;
//! engine.ensure_innate_registry(&[
//!     NodeSpec::new(1, NodeKind::Sensor),
//!     NodeSpec::new(45, NodeKind::Action),
//! ])?;
//!
//! engine.update_weight(1, 45, 0.5)?;
//! engine.spread_activation(1, 1.0)?;
//! let ranked = engine.compute_cd(&[])?;
//! engine.consolidate()?;
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod registry;
pub mod runtime;
pub mod status;
pub mod storage;

mod graph;
mod kernel;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use cache::CacheStats;
pub use config::{CachePolicy, CoalesceStrategy, CostModel, EngineConfig};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use registry::{InnateRegistry, NodeId, NodeKind, NodeSpec, Tick};
pub use runtime::{BatchOutcome, GuardMode, MetricsSnapshot, RuntimeOptions, StimulusInput};
pub use status::{ConsolidateReport, EngineStatus, MigrationReport, RuntimeStatus};
pub use storage::SynapseRec;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        BatchOutcome, Engine, EngineConfig, EngineError, EngineStatus, GuardMode, NodeId,
        NodeKind, NodeSpec, Result, RuntimeOptions, StimulusInput, SynapseRec,
    };
}
