//! Dependency Tracker
//!
//! The tracker knows which observer is currently running. This is what lets
//! a plain `signal.get()` register a dependency without any context being
//! passed around.
//!
//! # Implementation
//!
//! A single slot per thread, not a stack. Whoever starts a tracked region
//! saves the previous occupant and puts it back afterwards. The
//! [`TrackingScope`] guard does that restore in `Drop`, so it also happens
//! when the tracked code panics.
//!
//! Because each region restores exactly what it replaced, nested regions
//! compose: a computed evaluated while an effect is running swaps itself in,
//! records its own reads, and hands the slot back to the effect.

use std::cell::Cell;

use crate::graph::NodeId;

thread_local! {
    static ACTIVE: Cell<Option<NodeId>> = const { Cell::new(None) };
}

/// Replace the active observer, returning the previous one.
pub fn set_active(observer: Option<NodeId>) -> Option<NodeId> {
    ACTIVE.with(|slot| slot.replace(observer))
}

/// The observer currently being tracked, if any.
pub fn active() -> Option<NodeId> {
    ACTIVE.with(Cell::get)
}

/// Whether reads are currently being tracked.
pub fn is_tracking() -> bool {
    active().is_some()
}

/// Guard for a tracked region. Restores the previous observer when dropped.
#[must_use = "the tracked region ends when the scope is dropped"]
pub struct TrackingScope {
    previous: Option<NodeId>,
}

impl TrackingScope {
    /// Make `observer` the active observer until the guard is dropped.
    pub fn enter(observer: NodeId) -> Self {
        Self {
            previous: set_active(Some(observer)),
        }
    }

    /// Suspend tracking until the guard is dropped.
    pub fn untracked() -> Self {
        Self {
            previous: set_active(None),
        }
    }
}

impl Drop for TrackingScope {
    fn drop(&mut self) {
        set_active(self.previous);
    }
}

/// Run `f` without registering any dependency.
pub fn untrack<R>(f: impl FnOnce() -> R) -> R {
    let _scope = TrackingScope::untracked();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn scope_sets_and_restores_observer() {
        let id = NodeId::new();

        assert!(!is_tracking());
        assert!(active().is_none());

        {
            let _scope = TrackingScope::enter(id);
            assert!(is_tracking());
            assert_eq!(active(), Some(id));
        }

        assert!(!is_tracking());
        assert!(active().is_none());
    }

    #[test]
    fn nested_scopes_restore_outer_observer() {
        let outer = NodeId::new();
        let inner = NodeId::new();

        {
            let _outer = TrackingScope::enter(outer);
            {
                let _inner = TrackingScope::enter(inner);
                assert_eq!(active(), Some(inner));
            }
            assert_eq!(active(), Some(outer));
        }

        assert!(active().is_none());
    }

    #[test]
    fn set_active_returns_previous() {
        let a = NodeId::new();
        let b = NodeId::new();

        assert_eq!(set_active(Some(a)), None);
        assert_eq!(set_active(Some(b)), Some(a));
        assert_eq!(set_active(None), Some(b));
    }

    #[test]
    fn untrack_hides_observer() {
        let id = NodeId::new();
        let _scope = TrackingScope::enter(id);

        let seen = untrack(active);
        assert_eq!(seen, None);
        assert_eq!(active(), Some(id));
    }

    #[test]
    fn scope_restores_on_panic() {
        let outer = NodeId::new();
        let _outer = TrackingScope::enter(outer);

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _inner = TrackingScope::enter(NodeId::new());
            panic!("tracked code failed");
        }));

        assert!(result.is_err());
        assert_eq!(active(), Some(outer));
    }
}
