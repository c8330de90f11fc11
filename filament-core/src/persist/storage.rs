//! Storage adapters.
//!
//! The persister talks to storage through [`StorageAdapter`], an async
//! string key/value interface. Backends that are naturally synchronous
//! implement [`SyncStorage`] instead and are wrapped in [`SyncStorageAdapter`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StorageError;

/// Async key/value storage for persisted cache blobs.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set_item(&self, key: &str, value: String) -> Result<(), StorageError>;

    async fn remove_item(&self, key: &str) -> Result<(), StorageError>;
}

#[async_trait]
impl<A> StorageAdapter for Arc<A>
where
    A: StorageAdapter + ?Sized,
{
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).get_item(key).await
    }

    async fn set_item(&self, key: &str, value: String) -> Result<(), StorageError> {
        (**self).set_item(key, value).await
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        (**self).remove_item(key).await
    }
}

/// Blocking key/value storage.
pub trait SyncStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set_item(&self, key: &str, value: String) -> Result<(), StorageError>;

    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
}

/// Exposes a [`SyncStorage`] as a [`StorageAdapter`].
///
/// Calls run inline on the polling task; backends that block for long
/// should implement [`StorageAdapter`] directly.
#[derive(Debug, Clone, Default)]
pub struct SyncStorageAdapter<S> {
    storage: S,
}

impl<S: SyncStorage> SyncStorageAdapter<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn inner(&self) -> &S {
        &self.storage
    }
}

#[async_trait]
impl<S: SyncStorage> StorageAdapter for SyncStorageAdapter<S> {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.storage.get_item(key)
    }

    async fn set_item(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.storage.set_item(key, value)
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.storage.remove_item(key)
    }
}

/// In-process storage. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    items: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl SyncStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.items.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items.lock().remove(key);
        Ok(())
    }
}
