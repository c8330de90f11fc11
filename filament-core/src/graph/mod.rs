//! Dependency Graph
//!
//! This module holds the data structures behind automatic dependency
//! tracking: node identities, the edge store, and the per-thread update
//! scheduler.
//!
//! # Overview
//!
//! The graph is bipartite-ish: sources (signals, computeds, store
//! properties, store key sets) on one side, observers (computeds, effects)
//! on the other. A computed is both. An edge means "this observer read this
//! source during its last run".
//!
//! # Design Decisions
//!
//! 1. Edges live in one process-wide store rather than inside each signal,
//!    so store properties can get edge buckets without being declared.
//!
//! 2. Both directions are indexed, so dropping an observer's stale edges
//!    before a re-run is proportional to what it read, not to the graph.
//!
//! 3. Scheduling (batches, the effect queue) is per thread and kept apart
//!    from the edges, which are shared.

mod edges;
mod node;
mod scheduler;

pub use edges::{DependencyGraph, ObserverList};
pub use node::{NodeId, NodeState, SourceId};
pub use scheduler::{with_scheduler, UpdateScheduler};
