//! Subscriptions and lifecycle hooks.
//!
//! A subscription is an explicit callback attached to a signal or computed,
//! as opposed to an implicit dependency recorded by tracking. Each one is
//! backed by an effect owned by the value it watches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::graph::NodeId;

use super::effect::Effect;

/// Callback run when a value gains its first or loses its last subscriber.
pub type LifecycleHook = Arc<dyn Fn() + Send + Sync>;

type Release = Box<dyn FnOnce() + Send>;

/// Handle returned by `subscribe`.
///
/// Dropping the handle does not unsubscribe; call [`unsubscribe`]. Calling
/// it more than once has the same effect as calling it once.
///
/// [`unsubscribe`]: Subscription::unsubscribe
pub struct Subscription {
    release: Mutex<Option<Release>>,
}

impl Subscription {
    pub(crate) fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Mutex::new(Some(Box::new(release))),
        }
    }

    /// Remove the callback. Idempotent.
    pub fn unsubscribe(&self) {
        let release = self.release.lock().take();
        if let Some(release) = release {
            release();
        }
    }

    /// Whether `unsubscribe` has not been called yet.
    pub fn is_active(&self) -> bool {
        self.release.lock().is_some()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// The subscriptions of one value, plus its activation hooks.
pub(crate) struct Subscribers {
    owner: NodeId,
    entries: Mutex<IndexMap<u64, Effect>>,
    next_id: AtomicU64,
    on_active: Mutex<Option<LifecycleHook>>,
    on_inactive: Mutex<Option<LifecycleHook>>,
}

impl Subscribers {
    pub(crate) fn new(owner: NodeId) -> Self {
        Self {
            owner,
            entries: Mutex::new(IndexMap::new()),
            next_id: AtomicU64::new(0),
            on_active: Mutex::new(None),
            on_inactive: Mutex::new(None),
        }
    }

    pub(crate) fn set_on_active(&self, hook: LifecycleHook) {
        *self.on_active.lock() = Some(hook);
    }

    pub(crate) fn set_on_inactive(&self, hook: LifecycleHook) {
        *self.on_inactive.lock() = Some(hook);
    }

    /// Keep `effect` alive as a subscription. Fires `on_active` on 0 → 1.
    pub(crate) fn add(&self, effect: Effect) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut entries = self.entries.lock();
            entries.insert(id, effect);
            entries.len() == 1
        };
        trace!(owner = %self.owner, subscription = id, "subscribed");
        if first {
            let hook = self.on_active.lock().clone();
            if let Some(hook) = hook {
                hook();
            }
        }
        id
    }

    /// Drop a subscription. Fires `on_inactive` on 1 → 0.
    ///
    /// Returns `false` if it was already gone.
    pub(crate) fn remove(&self, id: u64) -> bool {
        let (removed, now_empty) = {
            let mut entries = self.entries.lock();
            let removed = entries.shift_remove(&id);
            (removed, entries.is_empty())
        };
        let Some(effect) = removed else {
            return false;
        };
        effect.dispose();
        drop(effect);
        trace!(owner = %self.owner, subscription = id, "unsubscribed");
        if now_empty {
            let hook = self.on_inactive.lock().clone();
            if let Some(hook) = hook {
                hook();
            }
        }
        true
    }

    pub(crate) fn count(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn unsubscribe_runs_release_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let subscription = Subscription::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(subscription.is_active());
        subscription.unsubscribe();
        subscription.unsubscribe();

        assert!(!subscription.is_active());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hooks_fire_on_transitions() {
        let subscribers = Subscribers::new(NodeId::new());
        let active = Arc::new(AtomicUsize::new(0));
        let inactive = Arc::new(AtomicUsize::new(0));

        let active_clone = active.clone();
        subscribers.set_on_active(Arc::new(move || {
            active_clone.fetch_add(1, Ordering::SeqCst);
        }));
        let inactive_clone = inactive.clone();
        subscribers.set_on_inactive(Arc::new(move || {
            inactive_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let first = subscribers.add(Effect::new_lazy(|| {}));
        let second = subscribers.add(Effect::new_lazy(|| {}));
        assert_eq!(active.load(Ordering::SeqCst), 1);
        assert_eq!(subscribers.count(), 2);

        assert!(subscribers.remove(first));
        assert_eq!(inactive.load(Ordering::SeqCst), 0);

        assert!(subscribers.remove(second));
        assert!(!subscribers.remove(second));
        assert_eq!(inactive.load(Ordering::SeqCst), 1);
        assert_eq!(subscribers.count(), 0);
    }
}
