//! Filament Core
//!
//! Fine-grained reactive state and an async query cache.
//!
//! - Reactive primitives (signals, computeds, effects) with automatic
//!   dependency tracking
//! - Reactive stores whose properties are tracked individually
//! - A query cache with request deduplication, staleness and eviction
//! - Persistence of the query cache to pluggable key/value storage
//!
//! # Architecture
//!
//! - `graph`: node identities, the dependency edge store and the update
//!   scheduler
//! - `reactive`: signals, computeds, effects, subscriptions and `batch`
//! - `store`: property-level reactive records
//! - `query`: the query cache and reactive query observers
//! - `persist`: storage adapters and the cache persister
//! - `config`, `error`: settings and error types shared by the above
//!
//! # Example
//!
//! ```rust
//! use filament_core::reactive::{Computed, Effect, Signal};
//! use std::sync::atomic::{AtomicI32, Ordering};
//! use std::sync::Arc;
//!
//! // Create a signal
//! let count = Signal::new(0);
//!
//! // Create a derived value
//! let source = count.clone();
//! let doubled = Computed::new(move || source.get() * 2);
//!
//! // Create an effect
//! let seen = Arc::new(AtomicI32::new(0));
//! let (derived, sink) = (doubled.clone(), seen.clone());
//! let _effect = Effect::new(move || sink.store(derived.get(), Ordering::SeqCst));
//!
//! // Update the signal; the effect has re-run by the time `set` returns
//! count.set(5);
//! assert_eq!(seen.load(Ordering::SeqCst), 10);
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod persist;
pub mod query;
pub mod reactive;
pub mod store;
