//! Update Scheduler
//!
//! The scheduler decides *when* propagation and effect re-runs happen.
//!
//! # Algorithm
//!
//! 1. Outside a batch, a write propagates immediately and the effect queue
//!    is flushed before the write returns.
//! 2. Inside a batch, the written source is only recorded. Recording the
//!    same source twice keeps one entry, so N writes to one property inside
//!    a batch produce one notification.
//! 3. When the outermost batch ends, each recorded source is propagated
//!    once (in first-write order) and the queue is flushed.
//! 4. Effects queued while the queue is being flushed (an effect writing a
//!    signal) are appended and run by the same flush loop; the flush is
//!    never re-entered.
//!
//! State is per thread: a batch is a synchronous region of one thread.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};

use indexmap::IndexSet;

use super::node::{NodeId, SourceId};

thread_local! {
    static SCHEDULER: RefCell<UpdateScheduler> = RefCell::new(UpdateScheduler::new());
}

/// Run `f` with this thread's scheduler.
///
/// The borrow must not outlive `f`; never call user code from inside.
pub fn with_scheduler<R>(f: impl FnOnce(&mut UpdateScheduler) -> R) -> R {
    SCHEDULER.with(|scheduler| f(&mut scheduler.borrow_mut()))
}

/// Batch depth, deferred sources and queued effects for one thread.
#[derive(Debug, Default)]
pub struct UpdateScheduler {
    /// Nesting depth of `batch` calls.
    batch_depth: usize,

    /// Sources written inside the current batch, deduplicated.
    pending_sources: IndexSet<SourceId>,

    /// Effects waiting to be re-checked, in the order they were marked.
    queue: VecDeque<NodeId>,

    /// Membership index for `queue`.
    queued: HashSet<NodeId>,

    /// Whether a flush loop is already running on this thread.
    flushing: bool,
}

impl UpdateScheduler {
    /// Create a new idle scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a (possibly nested) batch.
    pub fn begin_batch(&mut self) {
        self.batch_depth += 1;
    }

    /// Leave a batch.
    ///
    /// Returns the deduplicated sources to propagate when the outermost
    /// batch ends, `None` otherwise.
    pub fn end_batch(&mut self) -> Option<Vec<SourceId>> {
        self.batch_depth = self.batch_depth.saturating_sub(1);
        if self.batch_depth == 0 {
            Some(self.pending_sources.drain(..).collect())
        } else {
            None
        }
    }

    /// Whether a batch is open.
    pub fn is_batching(&self) -> bool {
        self.batch_depth > 0
    }

    /// Defer a write notification until the batch ends.
    ///
    /// Returns `false` when no batch is open; the caller must propagate now.
    pub fn defer(&mut self, source: SourceId) -> bool {
        if self.is_batching() {
            self.pending_sources.insert(source);
            true
        } else {
            false
        }
    }

    /// Queue an effect, keeping the first position if already queued.
    pub fn enqueue(&mut self, node: NodeId) {
        if self.queued.insert(node) {
            self.queue.push_back(node);
        }
    }

    /// Pop the next queued effect.
    pub fn next_effect(&mut self) -> Option<NodeId> {
        let node = self.queue.pop_front()?;
        self.queued.remove(&node);
        Some(node)
    }

    /// Claim the flush loop. Returns `false` if one is already running.
    pub fn begin_flush(&mut self) -> bool {
        if self.flushing || self.is_batching() {
            return false;
        }
        self.flushing = true;
        true
    }

    /// Release the flush loop.
    pub fn end_flush(&mut self) {
        self.flushing = false;
    }

    /// Drop everything queued or deferred. Used when unwinding.
    pub fn discard(&mut self) {
        self.queue.clear();
        self.queued.clear();
        self.pending_sources.clear();
        self.flushing = false;
    }

    /// Number of queued effects.
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }
}
