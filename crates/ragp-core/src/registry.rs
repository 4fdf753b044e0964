//! Innate registry: the authoritative set of valid node ids.
//!
//! Nodes are defined only here; runtime ingress never creates them. Every
//! public API rejects ids outside the registry with `UnknownNode`. The
//! registry carries a version; when the configured version differs from the
//! one embedded in storage, the engine migrates the on-disk graph (edges
//! whose endpoints survive are preserved, others are pruned).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Node identifier
pub type NodeId = u64;

/// Monotonic engine tick
pub type Tick = u32;

// ============================================================================
// NODE KIND
// ============================================================================

/// Role of a node in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// External signal entering the graph
    Sensor,
    /// Situation node modulating action scoring
    Context,
    /// Candidate output scored by `compute_cd`
    Action,
    /// Everything else
    #[default]
    Internal,
}

impl NodeKind {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Sensor => "sensor",
            NodeKind::Context => "context",
            NodeKind::Action => "action",
            NodeKind::Internal => "internal",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "sensor" => NodeKind::Sensor,
            "context" => NodeKind::Context,
            "action" => NodeKind::Action,
            _ => NodeKind::Internal,
        }
    }

    /// On-disk byte tag (node index `kind` field)
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            NodeKind::Sensor => 0,
            NodeKind::Context => 1,
            NodeKind::Action => 2,
            NodeKind::Internal => 3,
        }
    }

    /// Decode from the on-disk byte tag; unknown tags fall back to internal.
    pub(crate) fn from_u8(tag: u8) -> Self {
        match tag {
            0 => NodeKind::Sensor,
            1 => NodeKind::Context,
            2 => NodeKind::Action,
            _ => NodeKind::Internal,
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// NODE SPEC
// ============================================================================

/// One registry entry as supplied by external seeding config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node id
    pub id: NodeId,
    /// Node role
    #[serde(default)]
    pub kind: NodeKind,
    /// Optional human-readable label; kept in memory only
    #[serde(default)]
    pub label: Option<String>,
}

impl NodeSpec {
    /// Internal node with no label
    pub fn new(id: NodeId, kind: NodeKind) -> Self {
        Self {
            id,
            kind,
            label: None,
        }
    }
}

impl From<NodeId> for NodeSpec {
    fn from(id: NodeId) -> Self {
        NodeSpec::new(id, NodeKind::Internal)
    }
}

// ============================================================================
// INNATE REGISTRY
// ============================================================================

/// Versioned set of valid node ids and their kinds
#[derive(Debug, Clone, Default)]
pub struct InnateRegistry {
    version: u16,
    kinds: HashMap<NodeId, NodeKind>,
    labels: HashMap<NodeId, String>,
}

impl InnateRegistry {
    /// Build a registry from node specs. Duplicate ids keep the last spec.
    pub fn from_specs(version: u16, specs: &[NodeSpec]) -> Self {
        let mut kinds = HashMap::with_capacity(specs.len());
        let mut labels = HashMap::new();
        for spec in specs {
            kinds.insert(spec.id, spec.kind);
            if let Some(label) = &spec.label {
                labels.insert(spec.id, label.clone());
            }
        }
        Self {
            version,
            kinds,
            labels,
        }
    }

    /// Rebuild from persisted (id, kind) pairs; labels are not persisted.
    pub(crate) fn from_stored(version: u16, pairs: impl IntoIterator<Item = (NodeId, NodeKind)>) -> Self {
        Self {
            version,
            kinds: pairs.into_iter().collect(),
            labels: HashMap::new(),
        }
    }

    /// Registry version
    #[inline]
    pub fn version(&self) -> u16 {
        self.version
    }

    /// Number of registered nodes
    #[inline]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// True when no nodes are registered
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Membership test
    #[inline]
    pub fn contains(&self, id: NodeId) -> bool {
        self.kinds.contains_key(&id)
    }

    /// Kind of a registered node
    pub fn kind_of(&self, id: NodeId) -> Option<NodeKind> {
        self.kinds.get(&id).copied()
    }

    /// Label of a registered node, if seeding config provided one
    pub fn label_of(&self, id: NodeId) -> Option<&str> {
        self.labels.get(&id).map(String::as_str)
    }

    /// All registered ids, sorted
    pub fn sorted_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.kinds.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Ids of all action nodes, sorted
    pub fn action_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .kinds
            .iter()
            .filter(|(_, k)| **k == NodeKind::Action)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Iterate over (id, kind) pairs
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, NodeKind)> + '_ {
        self.kinds.iter().map(|(id, kind)| (*id, *kind))
    }
}
