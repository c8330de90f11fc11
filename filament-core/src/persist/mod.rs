//! Persistence Bridge
//!
//! Saves a [`QueryCache`](crate::query::QueryCache) to key/value storage and
//! restores it on the next start.
//!
//! ```rust
//! use filament_core::persist::{persist_query_cache, MemoryStorage, PersistOptions, SyncStorageAdapter};
//! use filament_core::query::QueryCache;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let cache: QueryCache<String> = QueryCache::default();
//! let storage = SyncStorageAdapter::new(MemoryStorage::new());
//!
//! // Restores whatever was saved, then saves again after every change.
//! let handle = persist_query_cache(&cache, storage, PersistOptions::default().with_buster("v1")).await;
//! assert!(handle.is_running());
//! # }
//! ```

mod persister;
mod storage;

pub use persister::{persist_query_cache, PersistHandle, PersistOptions, PersistedClient, Persister, DEFAULT_STORAGE_KEY};
pub use storage::{MemoryStorage, StorageAdapter, SyncStorage, SyncStorageAdapter};
