//! Computed Implementation
//!
//! A Computed is a cached derived value that re-evaluates only when its
//! dependencies change.
//!
//! # How Computeds Work
//!
//! 1. On first access, the computed runs its function inside a tracked
//!    region and caches the result. The reads made during that run are its
//!    dependencies; nothing is declared up front.
//!
//! 2. When a direct dependency is written, the computed becomes `Dirty`.
//!    When something further upstream is written, it becomes `MaybeDirty`.
//!
//! 3. On next access, a `MaybeDirty` computed first brings its own computed
//!    sources up to date. If none of them produced a different value, it
//!    goes back to `Clean` without running its function.
//!
//! 4. A `Dirty` computed re-runs. Only if the new value differs from the
//!    cached one (`PartialEq`) are its own observers told to re-run.
//!
//! Step 4 is why a diamond (A → B, A → C, B + C → D) evaluates D once per
//! write to A, and why a computed that lands on the same value does not
//! disturb anything downstream.
//!
//! # Threads
//!
//! Evaluation is serialized per computed by a reentrant lock. A reader on
//! another thread waits for the running evaluation and then sees its
//! result. Only the evaluating thread itself can get past the lock while
//! the function runs, which is how a self-read is told apart from a
//! concurrent one.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{ReentrantMutex, RwLock};
use tracing::trace;

use crate::error::ReactiveError;
use crate::graph::{NodeId, NodeState, SourceId};

use super::effect::Effect;
use super::runtime::{Reactive, ReactiveHandle, Runtime};
use super::subscriber::{LifecycleHook, Subscribers, Subscription};
use super::tracker::{untrack, TrackingScope};

/// A cached derived value that recomputes only when dependencies change.
///
/// The `PartialEq` bound is what lets a computed that recomputes to the
/// same value stop propagation.
///
/// # Example
///
/// ```rust
/// use filament_core::reactive::{Computed, Signal};
///
/// let count = Signal::new(2);
/// let reader = count.clone();
/// let doubled = Computed::new(move || reader.get() * 2);
///
/// assert_eq!(doubled.get(), 4);
/// count.set(5);
/// assert_eq!(doubled.get(), 10);
/// assert!(doubled.set(0).is_err());
/// ```
pub struct Computed<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    inner: Arc<ComputedInner<T>>,
}

struct ComputedInner<T> {
    id: NodeId,
    compute: Box<dyn Fn() -> T + Send + Sync>,
    value: RwLock<Option<T>>,
    state: AtomicU8,
    eval_lock: ReentrantMutex<()>,
    /// Set by the thread holding `eval_lock` while the function runs.
    evaluating: AtomicBool,
    version: AtomicU64,
    subscribers: Subscribers,
    _handle: ReactiveHandle,
}

impl<T> Computed<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    /// Create a new computed with the given function.
    ///
    /// The function is not run immediately. It runs on first access.
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let inner = Arc::new_cyclic(|weak: &Weak<ComputedInner<T>>| {
            let id = NodeId::new();
            ComputedInner {
                id,
                compute: Box::new(compute),
                value: RwLock::new(None),
                state: AtomicU8::new(NodeState::Dirty.to_u8()),
                eval_lock: ReentrantMutex::new(()),
                evaluating: AtomicBool::new(false),
                version: AtomicU64::new(0),
                subscribers: Subscribers::new(id),
                _handle: Runtime::register(id, weak.clone()),
            }
        });
        Self { inner }
    }

    /// Get the computed's node ID.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Get the current value, recomputing if necessary.
    ///
    /// # Panics
    ///
    /// Panics if the computed reads itself while producing its first value.
    pub fn get(&self) -> T {
        self.inner.read()
    }

    /// Get the current value without registering a dependency.
    pub fn get_untracked(&self) -> T {
        untrack(|| self.inner.read())
    }

    /// Computeds cannot be written.
    ///
    /// Always returns [`ReactiveError::ImmutableTarget`].
    pub fn set(&self, _value: T) -> Result<(), ReactiveError> {
        Err(ReactiveError::ImmutableTarget {
            target: format!("computed {}", self.inner.id),
        })
    }

    /// Force re-evaluation on next access.
    pub fn mark_dirty(&self) {
        self.inner.raise(NodeState::Dirty);
    }

    /// Get the current dirty state.
    pub fn state(&self) -> NodeState {
        self.inner.state()
    }

    /// Number of times the value changed after (re-)evaluation.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::SeqCst)
    }

    /// Check if the computed has a cached value.
    pub fn has_value(&self) -> bool {
        self.inner.value.read().is_some()
    }

    /// Get the number of dependencies recorded during the last evaluation.
    pub fn dependency_count(&self) -> usize {
        Runtime::source_count(self.inner.id)
    }

    /// Get the number of tracked observers.
    pub fn observer_count(&self) -> usize {
        Runtime::observer_count(&SourceId::Node(self.inner.id))
    }

    /// Invoke `callback` whenever the value changes.
    ///
    /// Re-evaluations that produce an equal value do not invoke it.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let weak: Weak<ComputedInner<T>> = Arc::downgrade(&self.inner);
        let first_run = AtomicBool::new(true);

        let effect = Effect::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let value = inner.read();
            if first_run.swap(false, Ordering::SeqCst) {
                return;
            }
            untrack(|| callback(&value));
        });

        let id = self.inner.subscribers.add(effect);
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.subscribers.remove(id);
            }
        })
    }

    /// Register a hook run when the first subscription is added.
    pub fn on_active<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.subscribers.set_on_active(Arc::new(hook) as LifecycleHook);
    }

    /// Register a hook run when the last subscription is removed.
    pub fn on_inactive<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.subscribers.set_on_inactive(Arc::new(hook) as LifecycleHook);
    }

    /// Get the number of subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.count()
    }
}

impl<T> ComputedInner<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    fn read(&self) -> T {
        Runtime::track(SourceId::Node(self.id));
        self.update_if_necessary();
        self.value.read().clone().unwrap_or_else(|| {
            panic!(
                "computed {} was read while producing its first value (dependency cycle)",
                self.id
            )
        })
    }

    /// Whether the cached value can be served without taking the lock.
    ///
    /// `evaluating` is raised before the state is cleared, so a `Clean`
    /// state seen together with `evaluating == false` always has its value
    /// written.
    fn is_settled(&self) -> bool {
        self.state() == NodeState::Clean && !self.evaluating.load(Ordering::SeqCst)
    }

    /// Must be called with `eval_lock` held.
    fn recompute(&self) {
        self.evaluating.store(true, Ordering::SeqCst);
        let _guard = EvaluationGuard {
            evaluating: &self.evaluating,
            state: &self.state,
        };

        // Clean before running, so a write observed mid-evaluation re-dirties us.
        self.state.store(NodeState::Clean.to_u8(), Ordering::SeqCst);
        Runtime::clear_sources(self.id);

        let next = {
            let _scope = TrackingScope::enter(self.id);
            (self.compute)()
        };

        let changed = {
            let mut value = self.value.write();
            let changed = value.as_ref() != Some(&next);
            if changed {
                *value = Some(next);
            }
            changed
        };

        if changed {
            let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            trace!(computed = %self.id, version, "computed value changed");
            Runtime::mark_observers_dirty(self.id);
        }
    }
}

impl<T> Reactive for ComputedInner<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
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
        if self.is_settled() {
            return;
        }
        let _eval = self.eval_lock.lock();
        if self.evaluating.load(Ordering::SeqCst) {
            // Re-entrant read from our own evaluation; serve the cached value.
            return;
        }
        Runtime::settle_sources(self);
        match self.state() {
            NodeState::Dirty => self.recompute(),
            NodeState::MaybeDirty => {
                // A write racing the settle leaves us `Dirty` for the next read.
                let _ = self.state.compare_exchange(
                    NodeState::MaybeDirty.to_u8(),
                    NodeState::Clean.to_u8(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
            NodeState::Clean => {}
        }
    }

    fn is_eager(&self) -> bool {
        false
    }
}

/// Clears the evaluating flag; leaves the computed dirty if evaluation panicked.
struct EvaluationGuard<'a> {
    evaluating: &'a AtomicBool,
    state: &'a AtomicU8,
}

impl Drop for EvaluationGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.state.store(NodeState::Dirty.to_u8(), Ordering::SeqCst);
        }
        self.evaluating.store(false, Ordering::SeqCst);
    }
}

impl<T> Clone for Computed<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Computed<T>
where
    T: Clone + Send + Sync + PartialEq + std::fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("value", &*self.inner.value.read())
            .field("version", &self.version())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Signal;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::{AtomicI32, AtomicUsize};
    use std::sync::OnceLock;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn computed_evaluates_on_first_access() {
        let call_count = Arc::new(AtomicI32::new(0));
        let call_count_clone = call_count.clone();

        let computed = Computed::new(move || {
            call_count_clone.fetch_add(1, Ordering::SeqCst);
            42
        });

        assert!(!computed.has_value());
        assert_eq!(call_count.load(Ordering::SeqCst), 0);

        assert_eq!(computed.get(), 42);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
        assert!(computed.has_value());
    }

    #[test]
    fn computed_caches_value_when_clean() {
        let call_count = Arc::new(AtomicI32::new(0));
        let call_count_clone = call_count.clone();

        let computed = Computed::new(move || {
            call_count_clone.fetch_add(1, Ordering::SeqCst);
            42
        });

        assert_eq!(computed.get(), 42);
        assert_eq!(computed.get(), 42);
        assert_eq!(computed.get(), 42);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn computed_recomputes_after_dependency_write() {
        let signal = Signal::new(10);
        let reader = signal.clone();
        let computed = Computed::new(move || reader.get() * 2);

        assert_eq!(computed.get(), 20);
        assert_eq!(computed.dependency_count(), 1);

        signal.set(5);
        assert_eq!(computed.state(), NodeState::Dirty);
        assert_eq!(computed.get(), 10);
        assert_eq!(computed.state(), NodeState::Clean);
    }

    #[test]
    fn computed_set_is_rejected() {
        let computed = Computed::new(|| 1);
        let err = computed.set(2).unwrap_err();
        assert!(matches!(err, ReactiveError::ImmutableTarget { .. }));
        assert_eq!(computed.get(), 1);
    }

    #[test]
    fn chained_computeds_propagate() {
        let base = Signal::new(5);
        let reader = base.clone();
        let doubled = Computed::new(move || reader.get() * 2);
        let doubled_reader = doubled.clone();
        let plus_ten = Computed::new(move || doubled_reader.get() + 10);

        assert_eq!(plus_ten.get(), 20);

        base.set(10);
        assert_eq!(plus_ten.state(), NodeState::MaybeDirty);
        assert_eq!(plus_ten.get(), 30);
        assert_eq!(doubled.get(), 20);
    }

    #[test]
    fn diamond_evaluates_sink_once() {
        let a = Signal::new(1);
        let evaluations = Arc::new(AtomicUsize::new(0));

        let a1 = a.clone();
        let b = Computed::new(move || a1.get() + 1);
        let a2 = a.clone();
        let c = Computed::new(move || a2.get() * 2);

        let (b1, c1, evals) = (b.clone(), c.clone(), evaluations.clone());
        let d = Computed::new(move || {
            evals.fetch_add(1, Ordering::SeqCst);
            b1.get() + c1.get()
        });

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (d1, seen_clone) = (d.clone(), seen.clone());
        let effect = Effect::new(move || seen_clone.lock().push(d1.get()));

        assert_eq!(*seen.lock(), vec![4]);
        evaluations.store(0, Ordering::SeqCst);

        a.set(10);

        // b = 11, c = 20: one evaluation of d, one effect run, combined value.
        assert_eq!(evaluations.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock(), vec![4, 31]);
        assert_eq!(effect.run_count(), 2);
    }

    #[test]
    fn equal_value_stops_propagation() {
        let number = Signal::new(1);
        let reader = number.clone();
        let parity = Computed::new(move || reader.get() % 2);

        let runs = Arc::new(AtomicUsize::new(0));
        let (parity_reader, runs_clone) = (parity.clone(), runs.clone());
        let _effect = Effect::new(move || {
            parity_reader.get();
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });

        number.set(3);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        number.set(4);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn subscribe_fires_only_on_change() {
        let number = Signal::new(1);
        let reader = number.clone();
        let parity = Computed::new(move || reader.get() % 2);

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let subscription = parity.subscribe(move |value| seen_clone.lock().push(*value));

        number.set(3);
        number.set(6);
        number.set(8);
        number.set(9);

        assert_eq!(*seen.lock(), vec![0, 1]);

        subscription.unsubscribe();
        number.set(10);
        assert_eq!(*seen.lock(), vec![0, 1]);
        assert_eq!(parity.subscriber_count(), 0);
    }

    #[test]
    fn panicking_evaluation_stays_dirty() {
        let fail = Signal::new(true);
        let reader = fail.clone();
        let computed = Computed::new(move || {
            if reader.get() {
                panic!("evaluation failed");
            }
            7
        });

        let result = catch_unwind(AssertUnwindSafe(|| computed.get()));
        assert!(result.is_err());
        assert_eq!(computed.state(), NodeState::Dirty);

        fail.set(false);
        assert_eq!(computed.get(), 7);
    }

    #[test]
    fn computed_clone_shares_state() {
        let computed1 = Computed::new(|| 42);
        assert_eq!(computed1.get(), 42);

        let computed2 = computed1.clone();
        assert_eq!(computed1.id(), computed2.id());
        assert!(computed2.has_value());

        computed1.mark_dirty();
        assert_eq!(computed2.state(), NodeState::Dirty);
    }

    #[test]
    fn reading_itself_first_time_panics() {
        let slot: Arc<OnceLock<Computed<i32>>> = Arc::new(OnceLock::new());
        let own = slot.clone();
        let computed = Computed::new(move || own.get().map_or(0, |me| me.get() + 1));
        let _ = slot.set(computed.clone());

        let result = catch_unwind(AssertUnwindSafe(|| computed.get()));
        assert!(result.is_err());
        assert_eq!(computed.state(), NodeState::Dirty);
    }

    #[test]
    fn concurrent_first_reads_share_one_evaluation() {
        let evaluations = Arc::new(AtomicUsize::new(0));
        let evals = evaluations.clone();
        let computed = Computed::new(move || {
            evals.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            42
        });

        let readers: Vec<_> = (0..2u64)
            .map(|i| {
                let computed = computed.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(20 * i));
                    computed.get()
                })
            })
            .collect();

        for reader in readers {
            assert_eq!(reader.join().unwrap(), 42);
        }
        assert_eq!(evaluations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reader_waits_for_recompute_on_another_thread() {
        let signal = Signal::new(1);
        let reader = signal.clone();
        let computed = Computed::new(move || {
            let value = reader.get();
            if value > 1 {
                thread::sleep(Duration::from_millis(100));
            }
            value * 10
        });
        assert_eq!(computed.get(), 10);

        signal.set(2);
        let slow = {
            let computed = computed.clone();
            thread::spawn(move || computed.get())
        };
        let late = {
            let computed = computed.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                computed.get()
            })
        };

        assert_eq!(slow.join().unwrap(), 20);
        assert_eq!(late.join().unwrap(), 20);
        assert_eq!(computed.state(), NodeState::Clean);
    }
}
