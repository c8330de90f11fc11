//! Query Cache
//!
//! Keyed storage for asynchronously fetched data, with freshness tracking,
//! request deduplication, prefix invalidation and time-based eviction.
//!
//! - [`QueryCache`]: the cache itself. Cheap to clone; clones share state.
//! - [`Query`]: one key bound to a fetch function, with reactive state.
//! - [`Clock`]: time source. Use [`ManualClock`] to drive staleness in tests.

mod cache;
mod clock;
mod entry;
mod key;
mod observer;

pub use cache::{CacheEvent, CacheStats, FetchFuture, QueryCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{CacheEntry, DehydratedQuery, DehydratedState, QueryOptions};
pub use key::QueryKey;
pub use observer::{Query, QueryObserverOptions, QueryState, QueryStatus};
