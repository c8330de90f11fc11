//! Reactive Primitives
//!
//! This module implements the core reactive system: signals, computeds, and
//! effects, tied together by automatic dependency tracking.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a container for mutable state. When a signal's value is read
//! within a tracked region (such as a computed or effect), the signal
//! automatically registers that region as a dependent. When the signal's
//! value changes, all dependents are notified.
//!
//! ## Computeds
//!
//! A Computed is a derived value that caches its result. It re-evaluates
//! only when one of its dependencies changes, and only tells its own
//! dependents about it when the result actually differs.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change. Subscriptions are effects owned by the value they
//! watch.
//!
//! # Implementation Notes
//!
//! The currently running observer lives in a thread-local slot (see
//! [`tracker`]). When a signal is read, we check that slot and, if an
//! observer is there, record the edge in the process-wide graph.

mod computed;
mod effect;
mod runtime;
mod signal;
mod subscriber;
pub mod tracker;

pub use computed::Computed;
pub use effect::Effect;
pub use runtime::{batch, Reactive, ReactiveHandle, Runtime};
pub use signal::Signal;
pub use subscriber::{LifecycleHook, Subscription};
pub use tracker::{untrack, TrackingScope};
