//! Effect Implementation
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs its function immediately to establish
//!    initial dependencies.
//!
//! 2. When any dependency changes, the effect is queued by the runtime and
//!    re-run before the write returns (or when the enclosing batch ends).
//!
//! 3. Before re-running, the effect drops its old edges and records new ones
//!    during execution, so a dependency read only on some runs is dropped on
//!    the runs that skip it.
//!
//! # Differences from Computed
//!
//! - Computeds return a value; effects do not.
//! - Computeds are lazy (compute on access); effects are eager.
//!
//! # Lifetime
//!
//! An effect stays live as long as one of its handles exists. Dropping the
//! last handle unregisters it and drops its edges.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::graph::{NodeId, NodeState};

use super::runtime::{Reactive, ReactiveHandle, Runtime};
use super::tracker::TrackingScope;

/// A side-effecting computation that runs when dependencies change.
///
/// # Example
///
/// ```rust
/// use filament_core::reactive::{Effect, Signal};
///
/// let count = Signal::new(0);
///
/// let reader = count.clone();
/// let effect = Effect::new(move || {
///     println!("Count is: {}", reader.get());
/// });
///
/// count.set(5); // Prints: "Count is: 5"
/// assert_eq!(effect.run_count(), 2);
/// ```
#[derive(Clone)]
pub struct Effect {
    inner: Arc<EffectInner>,
}

struct EffectInner {
    id: NodeId,
    run: Box<dyn Fn() + Send + Sync>,
    state: AtomicU8,
    disposed: AtomicBool,
    run_count: AtomicUsize,
    _handle: ReactiveHandle,
}

impl Effect {
    /// Create a new effect with the given function.
    ///
    /// The function runs immediately to establish initial dependencies.
    pub fn new<F>(run: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let effect = Self::new_lazy(run);
        effect.execute();
        effect
    }

    /// Create a new effect without running it immediately.
    ///
    /// It has no dependencies until [`execute`](Self::execute) is called.
    pub fn new_lazy<F>(run: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let inner = Arc::new_cyclic(|weak: &Weak<EffectInner>| {
            let id = NodeId::new();
            EffectInner {
                id,
                run: Box::new(run),
                state: AtomicU8::new(NodeState::Dirty.to_u8()),
                disposed: AtomicBool::new(false),
                run_count: AtomicUsize::new(0),
                _handle: Runtime::register(id, weak.clone()),
            }
        });
        Self { inner }
    }

    /// Get the effect's node ID.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Run the effect function now, re-recording its dependencies.
    ///
    /// A write made by the function that re-triggers this effect is picked
    /// up after the current run returns.
    pub fn execute(&self) {
        Runtime::run_claimed(|| self.inner.execute());
    }

    /// Force a re-run, as if a dependency had changed.
    pub fn schedule(&self) {
        self.inner.raise(NodeState::Dirty);
        Runtime::run_claimed(|| self.inner.update_if_necessary());
    }

    /// Dispose of the effect.
    ///
    /// After disposal the effect never runs again and holds no edges.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        Runtime::clear_sources(self.inner.id);
    }

    /// Check if the effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Get the number of times the effect has run.
    pub fn run_count(&self) -> usize {
        self.inner.run_count.load(Ordering::SeqCst)
    }

    /// Get the number of dependencies recorded during the last run.
    pub fn dependency_count(&self) -> usize {
        Runtime::source_count(self.inner.id)
    }
}

impl EffectInner {
    fn execute(&self) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        // Clean before running, so a write made by the body itself re-queues us.
        self.state.store(NodeState::Clean.to_u8(), Ordering::SeqCst);
        Runtime::clear_sources(self.id);

        {
            let _scope = TrackingScope::enter(self.id);
            (self.run)();
        }

        self.run_count.fetch_add(1, Ordering::SeqCst);
    }
}

impl Reactive for EffectInner {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn raise(&self, state: NodeState) -> NodeState {
        NodeState::from_u8(self.state.fetch_max(state.to_u8(), Ordering::SeqCst))
    }

    fn update_if_necessary(&self) {
        if self.disposed.load(Ordering::SeqCst) {
            self.state.store(NodeState::Clean.to_u8(), Ordering::SeqCst);
            return;
        }
        Runtime::settle_sources(self);
        if self.state() == NodeState::Dirty {
            self.execute();
        } else {
            self.state.store(NodeState::Clean.to_u8(), Ordering::SeqCst);
        }
    }

    fn is_eager(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.inner.id)
            .field("run_count", &self.run_count())
            .field("dependency_count", &self.dependency_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
