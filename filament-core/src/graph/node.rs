//! Graph Nodes
//!
//! Identities and states for everything that lives in the dependency graph.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Unique identifier for a node in the dependency graph.
///
/// Signals, computeds, effects and stores all draw from the same counter,
/// so an id never collides across node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Dirty state of an observer node.
///
/// The ordering matters: a node is only ever raised towards `Dirty` by
/// propagation, and lowered back to `Clean` by its own update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    /// The node's value is up-to-date.
    Clean,

    /// Something upstream changed, but we have not yet verified whether
    /// the node's direct sources produced different values.
    MaybeDirty,

    /// A direct source definitely changed. The node must re-run.
    Dirty,
}

impl NodeState {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            NodeState::Clean => 0,
            NodeState::MaybeDirty => 1,
            NodeState::Dirty => 2,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => NodeState::Clean,
            1 => NodeState::MaybeDirty,
            _ => NodeState::Dirty,
        }
    }
}

/// Something an observer can depend on.
///
/// Store properties get their own source identity, which is what makes
/// store writes notify only the readers of the written property.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceId {
    /// A signal or a computed.
    Node(NodeId),

    /// A single property of a store.
    Property { store: NodeId, key: Arc<str> },

    /// The key set of a store (enumeration, length, membership changes).
    Keys { store: NodeId },
}

impl SourceId {
    /// The node this source belongs to.
    pub fn owner(&self) -> NodeId {
        match self {
            SourceId::Node(id) => *id,
            SourceId::Property { store, .. } | SourceId::Keys { store } => *store,
        }
    }

    /// The node id if this source is itself a node (signal or computed).
    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            SourceId::Node(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceId::Node(id) => write!(f, "{id}"),
            SourceId::Property { store, key } => write!(f, "{store}.{key}"),
            SourceId::Keys { store } => write!(f, "{store}.<keys>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_are_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn state_ordering_raises_towards_dirty() {
        assert!(NodeState::Clean < NodeState::MaybeDirty);
        assert!(NodeState::MaybeDirty < NodeState::Dirty);
    }

    #[test]
    fn state_round_trips_through_u8() {
        for state in [NodeState::Clean, NodeState::MaybeDirty, NodeState::Dirty] {
            assert_eq!(NodeState::from_u8(state.to_u8()), state);
        }
    }

    #[test]
    fn property_sources_differ_by_key() {
        let store = NodeId::new();
        let x = SourceId::Property { store, key: Arc::from("x") };
        let y = SourceId::Property { store, key: Arc::from("y") };

        assert_ne!(x, y);
        assert_eq!(x.owner(), store);
        assert_eq!(x.as_node(), None);
        assert_ne!(SourceId::Keys { store }, x);
    }
}
