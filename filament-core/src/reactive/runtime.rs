//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects signals, computeds,
//! effects and stores. It owns the dependency edges and decides which
//! observers re-run after a write.
//!
//! # How It Works
//!
//! 1. Observer nodes (computeds, effects) register with the runtime. The
//!    registry holds them weakly; dropping the last handle unregisters them.
//!
//! 2. A read inside a tracked region records an edge from the source to
//!    the active observer.
//!
//! 3. A write marks direct observers `Dirty` and everything further
//!    downstream `MaybeDirty`. Effects reached this way are queued.
//!
//! 4. The queue is flushed. Each effect first brings its computed sources up
//!    to date; a computed that recomputes to an equal value does not dirty
//!    its observers, so an effect whose inputs all settled unchanged does
//!    not re-run. This is what makes diamond-shaped graphs re-run their sink
//!    exactly once.
//!
//! # Thread Safety
//!
//! The registry and edges are process-wide behind locks, so reactive values
//! can be shared across threads. The active observer and the batch/effect
//! queue are per thread. No lock is ever held while user code runs.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::graph::{with_scheduler, DependencyGraph, NodeId, NodeState, SourceId, UpdateScheduler};

use super::tracker;

/// A node that re-runs when its dependencies change.
pub trait Reactive: Send + Sync {
    /// The node's id in the dependency graph.
    fn node_id(&self) -> NodeId;

    /// Current dirty state.
    fn state(&self) -> NodeState;

    /// Raise the dirty state to at least `state`, returning the previous one.
    fn raise(&self, state: NodeState) -> NodeState;

    /// Re-run if, and only if, a source actually changed.
    fn update_if_necessary(&self);

    /// Effects are eager (queued on change); computeds are lazy.
    fn is_eager(&self) -> bool;
}

/// Handle to a registered reactive node.
///
/// Dropping this handle unregisters the node and drops all of its edges.
pub struct ReactiveHandle {
    node: NodeId,
}

impl ReactiveHandle {
    /// The registered node.
    pub fn node_id(&self) -> NodeId {
        self.node
    }
}

impl Drop for ReactiveHandle {
    fn drop(&mut self) {
        Runtime::unregister(self.node);
    }
}

/// The global reactive runtime.
pub struct Runtime;

static REGISTRY: OnceLock<DashMap<NodeId, Weak<dyn Reactive>>> = OnceLock::new();
static GRAPH: OnceLock<Mutex<DependencyGraph>> = OnceLock::new();

fn registry() -> &'static DashMap<NodeId, Weak<dyn Reactive>> {
    REGISTRY.get_or_init(DashMap::new)
}

fn graph() -> &'static Mutex<DependencyGraph> {
    GRAPH.get_or_init(|| Mutex::new(DependencyGraph::new()))
}

impl Runtime {
    /// Register an observer node.
    ///
    /// Returns a handle that unregisters the node when dropped. Nodes build
    /// this inside `Arc::new_cyclic` and keep it in their own state.
    pub fn register(node: NodeId, reactive: Weak<dyn Reactive>) -> ReactiveHandle {
        registry().insert(node, reactive);
        ReactiveHandle { node }
    }

    fn unregister(node: NodeId) {
        registry().remove(&node);
        graph().lock().remove_node(node);
        trace!(%node, "observer unregistered");
    }

    /// Look up a live observer node.
    pub(crate) fn lookup(node: NodeId) -> Option<Arc<dyn Reactive>> {
        let weak = registry().get(&node).map(|entry| entry.value().clone())?;
        weak.upgrade()
    }

    /// Record that the active observer read `source`.
    ///
    /// Does nothing outside a tracked region. Reading the same source twice
    /// in one run records one edge.
    pub fn track(source: SourceId) {
        let Some(observer) = tracker::active() else {
            return;
        };
        if observer == source.owner() {
            return;
        }
        let added = graph().lock().add_edge(source.clone(), observer);
        if added {
            trace!(%source, %observer, "dependency recorded");
        }
    }

    /// Drop every edge from `observer` to its sources.
    ///
    /// Called before re-running a computation so edges reflect only the
    /// reads of the new run.
    pub fn clear_sources(observer: NodeId) {
        graph().lock().clear_sources(observer);
    }

    /// Drop every edge pointing at sources owned by `owner`.
    pub fn forget(owner: NodeId) {
        graph().lock().forget_owner(owner);
    }

    /// Number of observers currently depending on `source`.
    pub fn observer_count(source: &SourceId) -> usize {
        graph().lock().observer_count(source)
    }

    /// Number of sources `observer` read during its last run.
    pub fn source_count(observer: NodeId) -> usize {
        graph().lock().source_count(observer)
    }

    /// Announce that `source` was written.
    ///
    /// Inside a batch the notification is deferred; otherwise observers are
    /// marked and queued effects run before this returns.
    pub fn notify(source: SourceId) {
        if with_scheduler(|scheduler| scheduler.defer(source.clone())) {
            trace!(%source, "write deferred to batch end");
            return;
        }
        Self::propagate(&source);
        Self::flush();
    }

    /// Mark observers downstream of `source` and queue reachable effects.
    fn propagate(source: &SourceId) {
        let direct = graph().lock().observers_of(source);
        trace!(%source, observers = direct.len(), "propagating write");

        let mut pending: VecDeque<(NodeId, NodeState)> = direct
            .into_iter()
            .map(|node| (node, NodeState::Dirty))
            .collect();

        while let Some((node, state)) = pending.pop_front() {
            let Some(reactive) = Self::lookup(node) else {
                continue;
            };
            if reactive.raise(state) != NodeState::Clean {
                // Already marked by an earlier path; its downstream is too.
                continue;
            }
            if reactive.is_eager() {
                with_scheduler(|scheduler| scheduler.enqueue(node));
            }
            let downstream = graph().lock().observers_of(&SourceId::Node(node));
            pending.extend(
                downstream
                    .into_iter()
                    .map(|child| (child, NodeState::MaybeDirty)),
            );
        }
    }

    /// Upgrade observers of a recomputed node from `MaybeDirty` to `Dirty`.
    ///
    /// Called by a computed whose value changed. Observers that are `Clean`
    /// are either running right now or already saw the new value.
    pub(crate) fn mark_observers_dirty(node: NodeId) {
        let observers = graph().lock().observers_of(&SourceId::Node(node));
        for observer in observers {
            if let Some(reactive) = Self::lookup(observer) {
                if reactive.state() == NodeState::MaybeDirty {
                    reactive.raise(NodeState::Dirty);
                }
            }
        }
    }

    /// Bring the computed sources of a `MaybeDirty` observer up to date.
    ///
    /// Stops as soon as one of them changed, which leaves the observer
    /// `Dirty`.
    pub(crate) fn settle_sources(observer: &dyn Reactive) {
        if observer.state() != NodeState::MaybeDirty {
            return;
        }
        let sources = graph().lock().node_sources_of(observer.node_id());
        for source in sources {
            if let Some(reactive) = Self::lookup(source) {
                reactive.update_if_necessary();
            }
            if observer.state() == NodeState::Dirty {
                break;
            }
        }
    }

    /// Run queued effects until the queue is empty.
    fn flush() {
        Self::run_claimed(|| {});
    }

    /// Run `f` as the owner of this thread's flush loop, then drain the
    /// effect queue.
    ///
    /// Effects queued by writes inside `f` run after `f` returns instead of
    /// nesting inside it. When a flush or batch is already open, `f` runs
    /// inline and the outer owner drains the queue.
    pub(crate) fn run_claimed(f: impl FnOnce()) {
        if !with_scheduler(UpdateScheduler::begin_flush) {
            f();
            return;
        }
        let _guard = FlushGuard;
        f();
        while let Some(node) = with_scheduler(UpdateScheduler::next_effect) {
            if let Some(effect) = Self::lookup(node) {
                effect.update_if_necessary();
            }
        }
    }
}

struct FlushGuard;

impl Drop for FlushGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            with_scheduler(UpdateScheduler::discard);
        } else {
            with_scheduler(UpdateScheduler::end_flush);
        }
    }
}

/// Coalesce notifications until `f` returns.
///
/// Every source written inside the batch is propagated once after the
/// outermost batch completes, no matter how many times it was written, so
/// observers never see intermediate states.
///
/// # Example
///
/// ```rust
/// use filament_core::reactive::{batch, Signal};
///
/// let first = Signal::new("Ada".to_string());
/// let last = Signal::new("Lovelace".to_string());
///
/// batch(|| {
///     first.set("Grace".to_string());
///     last.set("Hopper".to_string());
/// });
/// ```
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    with_scheduler(UpdateScheduler::begin_batch);
    let mut guard = BatchGuard { finished: false };
    let result = f();
    guard.finish();
    result
}

struct BatchGuard {
    finished: bool,
}

impl BatchGuard {
    fn finish(&mut self) {
        self.finished = true;
        let Some(sources) = with_scheduler(UpdateScheduler::end_batch) else {
            return;
        };
        if sources.is_empty() {
            return;
        }
        trace!(sources = sources.len(), "batch released");
        for source in &sources {
            Runtime::propagate(source);
        }
        Runtime::flush();
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        if !self.finished {
            // Unwinding out of the batch: close it without notifying.
            let released = with_scheduler(UpdateScheduler::end_batch);
            if released.is_some() {
                with_scheduler(UpdateScheduler::discard);
            }
        }
    }
}
