//! Vector clocks for session state touched by more than one instance.
//!
//! A clock only *detects* causal relationships between two versions of a
//! piece of state. Deciding what to do with a `Concurrent` result is the
//! caller's job (see `store::session`).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Causal relationship of one clock to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockOrdering {
    /// This clock happened before the other.
    Before,
    /// This clock happened after (dominates) the other.
    After,
    /// Both sides advanced independently.
    Concurrent,
    /// Entrywise identical.
    Equal,
}

impl ClockOrdering {
    /// Whether a write carrying this clock may replace the other side.
    pub fn supersedes(&self) -> bool {
        matches!(self, Self::After)
    }
}

impl std::fmt::Display for ClockOrdering {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Before => "before",
            Self::After => "after",
            Self::Concurrent => "concurrent",
            Self::Equal => "equal",
        };
        write!(f, "{s}")
    }
}

/// Per-node logical clock.
///
/// Counters never decrease and entries are never removed, even when the node
/// that contributed them has gone away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    node_id: String,
    counters: BTreeMap<String, u64>,
}

impl VectorClock {
    /// Create a fresh clock owned by `node_id`.
    pub fn new(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        let mut counters = BTreeMap::new();
        counters.insert(node_id.clone(), 0);
        Self { node_id, counters }
    }

    /// Take over a clock received from elsewhere (e.g. loaded from the store)
    /// as this node's own. Existing entries are kept; the owner's entry is
    /// added at zero if it was missing.
    pub fn adopt(mut self, node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        self.counters.entry(node_id.clone()).or_insert(0);
        self.node_id = node_id;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Counter for `node`, zero when the node never contributed.
    pub fn get(&self, node: &str) -> u64 {
        self.counters.get(node).copied().unwrap_or(0)
    }

    pub fn counters(&self) -> &BTreeMap<String, u64> {
        &self.counters
    }

    /// Record a local event.
    pub fn tick(&mut self) -> &mut Self {
        let counter = self.counters.entry(self.node_id.clone()).or_insert(0);
        *counter = counter.saturating_add(1);
        self
    }

    /// Receive a peer's clock: a local event followed by an elementwise max.
    pub fn update(&mut self, other: &VectorClock) -> &mut Self {
        self.tick();
        self.join(other);
        self
    }

    /// Pure causal join (elementwise max) without a local event.
    ///
    /// Commutative and idempotent over the counters; the owner of the result
    /// is the owner of `self`.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.clone();
        merged.join(other);
        merged
    }

    fn join(&mut self, other: &VectorClock) {
        for (node, &count) in &other.counters {
            let entry = self.counters.entry(node.clone()).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
    }

    /// Compare across the union of node ids in both clocks.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let nodes: BTreeSet<&String> = self.counters.keys().chain(other.counters.keys()).collect();

        let mut greater = false;
        let mut less = false;
        for node in nodes {
            let mine = self.get(node);
            let theirs = other.get(node);
            if mine > theirs {
                greater = true;
            } else if mine < theirs {
                less = true;
            }
            if greater && less {
                return ClockOrdering::Concurrent;
            }
        }

        match (greater, less) {
            (true, false) => ClockOrdering::After,
            (false, true) => ClockOrdering::Before,
            (false, false) => ClockOrdering::Equal,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// `self` is entrywise >= `other`.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            ClockOrdering::After | ClockOrdering::Equal
        )
    }
}
