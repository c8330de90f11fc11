//! Dependency Edges
//!
//! The edge store for the whole process. Each edge is kept in both
//! directions: source → observers (to notify on write) and observer →
//! sources (to drop stale edges before a re-run).

use std::collections::HashMap;

use indexmap::IndexSet;
use smallvec::SmallVec;

use super::node::{NodeId, SourceId};

/// Observers collected for a single notification.
pub type ObserverList = SmallVec<[NodeId; 8]>;

/// Bidirectional dependency edges.
///
/// Buckets are created lazily on the first tracked read of a source and
/// removed again once they become empty.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Observers of each source, in registration order.
    observers: HashMap<SourceId, IndexSet<NodeId>>,

    /// Sources read by each observer during its last run.
    sources: HashMap<NodeId, IndexSet<SourceId>>,
}

impl DependencyGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `observer` read `source`.
    ///
    /// Returns `false` if the edge already existed.
    pub fn add_edge(&mut self, source: SourceId, observer: NodeId) -> bool {
        let inserted = self
            .observers
            .entry(source.clone())
            .or_default()
            .insert(observer);
        if inserted {
            self.sources.entry(observer).or_default().insert(source);
        }
        inserted
    }

    /// Drop every edge from `observer` to its sources.
    pub fn clear_sources(&mut self, observer: NodeId) {
        let Some(sources) = self.sources.remove(&observer) else {
            return;
        };
        for source in sources {
            if let Some(bucket) = self.observers.get_mut(&source) {
                bucket.shift_remove(&observer);
                if bucket.is_empty() {
                    self.observers.remove(&source);
                }
            }
        }
    }

    /// Drop every edge pointing at sources owned by `owner`.
    ///
    /// Called when a signal, computed or store goes away.
    pub fn forget_owner(&mut self, owner: NodeId) {
        let doomed: Vec<SourceId> = self
            .observers
            .keys()
            .filter(|source| source.owner() == owner)
            .cloned()
            .collect();

        for source in doomed {
            if let Some(bucket) = self.observers.remove(&source) {
                for observer in bucket {
                    if let Some(sources) = self.sources.get_mut(&observer) {
                        sources.shift_remove(&source);
                    }
                }
            }
        }
    }

    /// Remove an observer completely, both as an observer and as a source.
    pub fn remove_node(&mut self, node: NodeId) {
        self.clear_sources(node);
        self.forget_owner(node);
    }

    /// Observers of `source`, in registration order.
    pub fn observers_of(&self, source: &SourceId) -> ObserverList {
        self.observers
            .get(source)
            .map(|bucket| bucket.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Node sources (signals and computeds) read by `observer`, in read order.
    pub fn node_sources_of(&self, observer: NodeId) -> ObserverList {
        self.sources
            .get(&observer)
            .map(|sources| sources.iter().filter_map(SourceId::as_node).collect())
            .unwrap_or_default()
    }

    /// Number of sources `observer` read during its last run.
    pub fn source_count(&self, observer: NodeId) -> usize {
        self.sources.get(&observer).map_or(0, IndexSet::len)
    }

    /// Number of observers of `source`.
    pub fn observer_count(&self, source: &SourceId) -> usize {
        self.observers.get(source).map_or(0, IndexSet::len)
    }

    /// Whether an edge bucket exists for `source`.
    pub fn has_bucket(&self, source: &SourceId) -> bool {
        self.observers.contains_key(source)
    }
}
