//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive. It holds a value and
//! tracks which computations depend on it.
//!
//! # How Signals Work
//!
//! 1. When a signal is read within a tracked region (computed/effect), the
//!    signal registers that region's observer as a dependent.
//!
//! 2. When a signal is written, every dependent is notified. A write always
//!    counts as a change; there is no equality check.
//!
//! 3. Notification is synchronous: dependent effects have re-run by the time
//!    `set` returns, unless the write happens inside [`batch`], in which case
//!    they run once when the outermost batch ends.
//!
//! # Thread Safety
//!
//! The value is protected by a `parking_lot::RwLock`. [`Signal::update`]
//! holds the write lock for the whole read-modify-write, so concurrent
//! updates from several threads never lose an increment.
//!
//! [`batch`]: super::batch

use std::fmt::Debug;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::trace;

use crate::graph::{NodeId, SourceId};

use super::effect::Effect;
use super::runtime::Runtime;
use super::subscriber::{LifecycleHook, Subscribers, Subscription};
use super::tracker::untrack;

/// A reactive signal holding a value of type T.
///
/// Cloning a signal creates a new handle to the same value.
///
/// # Example
///
/// ```rust
/// use filament_core::reactive::Signal;
///
/// let count = Signal::new(0);
/// assert_eq!(count.get(), 0);
///
/// count.set(5);
/// count.update(|n| n + 1);
/// assert_eq!(count.get(), 6);
/// ```
pub struct Signal<T>
where
    T: Send + Sync + 'static,
{
    inner: Arc<SignalInner<T>>,
}

struct SignalInner<T> {
    id: NodeId,
    value: RwLock<T>,
    subscribers: Subscribers,
}

impl<T> Drop for SignalInner<T> {
    fn drop(&mut self) {
        Runtime::forget(self.id);
    }
}

impl<T> Signal<T>
where
    T: Send + Sync + 'static,
{
    /// Create a new signal with the given initial value.
    pub fn new(value: T) -> Self {
        let id = NodeId::new();
        Self {
            inner: Arc::new(SignalInner {
                id,
                value: RwLock::new(value),
                subscribers: Subscribers::new(id),
            }),
        }
    }

    /// Get the signal's node ID.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Read the value by reference.
    ///
    /// Registers a dependency like [`get`](Self::get). The closure must not
    /// write this signal.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        Runtime::track(SourceId::Node(self.inner.id));
        f(&self.inner.value.read())
    }

    /// Set a new value and notify dependents.
    pub fn set(&self, value: T) {
        *self.inner.value.write() = value;
        self.notify();
    }

    /// Update the value from the current one and notify dependents.
    ///
    /// The read-modify-write is atomic with respect to other writers. The
    /// closure must not access this signal.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        {
            let mut guard = self.inner.value.write();
            let next = f(&guard);
            *guard = next;
        }
        self.notify();
    }

    /// Mutate the value in place and notify dependents.
    pub fn update_in_place<F>(&self, f: F)
    where
        F: FnOnce(&mut T),
    {
        f(&mut self.inner.value.write());
        self.notify();
    }

    fn notify(&self) {
        trace!(signal = %self.inner.id, "signal written");
        Runtime::notify(SourceId::Node(self.inner.id));
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

    /// Whether at least one subscription exists.
    pub fn is_watched(&self) -> bool {
        self.subscriber_count() > 0
    }

    /// Get the number of tracked observers (computeds, effects, subscriptions).
    pub fn observer_count(&self) -> usize {
        Runtime::observer_count(&SourceId::Node(self.inner.id))
    }
}

impl<T> Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Get the current value.
    ///
    /// If called within a tracked region, this also registers the current
    /// observer as a dependent.
    pub fn get(&self) -> T {
        Runtime::track(SourceId::Node(self.inner.id));
        self.get_untracked()
    }

    /// Get the current value without tracking dependencies.
    pub fn get_untracked(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Invoke `callback` with the new value after every write.
    ///
    /// The callback is not invoked for the current value, and its own reads
    /// are not tracked.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let weak: Weak<SignalInner<T>> = Arc::downgrade(&self.inner);
        let first_run = std::sync::atomic::AtomicBool::new(true);

        let effect = Effect::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            Runtime::track(SourceId::Node(inner.id));
            if first_run.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return;
            }
            let value = inner.value.read().clone();
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
}

impl<T> Clone for Signal<T>
where
    T: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Signal<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.inner.id)
            .field("value", &self.get_untracked())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
