//! Cache persistence.
//!
//! A [`Persister`] saves a [`QueryCache`] to a [`StorageAdapter`] as one JSON
//! blob and restores it at startup:
//!
//! ```text
//! { "timestamp": 1700000000000,
//!   "buster": "v2",
//!   "clientState": { "queries": [ { "queryKey": ["users", "1"], "data": ...,
//!                                   "timestamp": ..., "staleTime": 0,
//!                                   "cacheTime": null } ] } }
//! ```
//!
//! Restoring is best effort. A blob that is malformed, older than
//! `max_age`, or written under another buster is removed, and the cache
//! starts cold. Saving is throttled: a burst of cache changes produces one
//! write, `throttle` after the first change of the burst.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{millis, optional_millis};
use crate::error::{HydrationError, PersistError, StorageError};
use crate::query::{DehydratedState, QueryCache};

use super::storage::StorageAdapter;

/// Storage key used when none is configured.
pub const DEFAULT_STORAGE_KEY: &str = "filament-query-cache";

const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_THROTTLE: Duration = Duration::from_millis(1000);

/// Settings for a [`Persister`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistOptions {
    /// Storage key of the blob.
    pub key: String,

    /// Oldest blob, and oldest entry within it, that will be restored.
    /// `None` accepts any age.
    #[serde(with = "optional_millis")]
    pub max_age: Option<Duration>,

    /// Blobs written under a different buster are discarded. Change it when
    /// the cached data's shape changes.
    pub buster: String,

    /// Delay between a cache change and the write it triggers.
    #[serde(with = "millis")]
    pub throttle: Duration,
}

impl Default for PersistOptions {
    fn default() -> Self {
        Self {
            key: DEFAULT_STORAGE_KEY.to_string(),
            max_age: Some(DEFAULT_MAX_AGE),
            buster: String::new(),
            throttle: DEFAULT_THROTTLE,
        }
    }
}

impl PersistOptions {
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_buster(mut self, buster: impl Into<String>) -> Self {
        self.buster = buster.into();
        self
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }
}

/// The persisted blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedClient<T> {
    pub timestamp: u64,
    pub buster: String,
    pub client_state: DehydratedState<T>,
}

/// Saves and restores one cache through one storage adapter.
pub struct Persister<T> {
    cache: QueryCache<T>,
    storage: Arc<dyn StorageAdapter>,
    options: PersistOptions,
}

impl<T> Clone for Persister<T> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            storage: Arc::clone(&self.storage),
            options: self.options.clone(),
        }
    }
}

impl<T> Persister<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(cache: &QueryCache<T>, storage: impl StorageAdapter + 'static, options: PersistOptions) -> Self {
        Self {
            cache: cache.clone(),
            storage: Arc::new(storage),
            options,
        }
    }

    pub fn options(&self) -> &PersistOptions {
        &self.options
    }

    /// Load the persisted blob into the cache.
    ///
    /// Returns the number of entries restored; a missing blob restores
    /// none. A rejected blob is removed from storage before the error is
    /// returned.
    pub async fn try_restore(&self) -> Result<usize, HydrationError> {
        let Some(raw) = self.storage.get_item(&self.options.key).await? else {
            debug!(key = %self.options.key, "no persisted cache");
            return Ok(0);
        };

        match self.check(&raw) {
            Ok(client) => {
                let restored = self.cache.hydrate(client.client_state, self.options.max_age);
                debug!(key = %self.options.key, restored, "restored persisted cache");
                Ok(restored)
            }
            Err(err) => {
                if let Err(remove_err) = self.storage.remove_item(&self.options.key).await {
                    warn!(key = %self.options.key, error = %remove_err, "could not remove rejected cache blob");
                }
                Err(err)
            }
        }
    }

    fn check(&self, raw: &str) -> Result<PersistedClient<T>, HydrationError> {
        let client: PersistedClient<T> = serde_json::from_str(raw)?;

        if client.buster != self.options.buster {
            return Err(HydrationError::BusterMismatch {
                expected: self.options.buster.clone(),
                found: client.buster,
            });
        }
        if let Some(max_age) = self.options.max_age {
            let age_ms = self.cache.now_ms().saturating_sub(client.timestamp);
            let max_age_ms = max_age.as_millis() as u64;
            if age_ms > max_age_ms {
                return Err(HydrationError::Expired { age_ms, max_age_ms });
            }
        }
        Ok(client)
    }

    /// Like [`try_restore`](Self::try_restore), but a failure is logged and
    /// treated as an empty blob.
    pub async fn restore(&self) -> usize {
        match self.try_restore().await {
            Ok(restored) => restored,
            Err(err) => {
                warn!(key = %self.options.key, error = %err, "discarding persisted cache");
                0
            }
        }
    }

    /// Write the current cache contents to storage.
    pub async fn persist(&self) -> Result<(), PersistError> {
        let client = PersistedClient {
            timestamp: self.cache.now_ms(),
            buster: self.options.buster.clone(),
            client_state: self.cache.dehydrate(),
        };
        let blob = serde_json::to_string(&client)?;
        self.storage.set_item(&self.options.key, blob).await?;
        debug!(key = %self.options.key, queries = client.client_state.len(), "persisted cache");
        Ok(())
    }

    /// Delete the persisted blob.
    pub async fn remove(&self) -> Result<(), StorageError> {
        self.storage.remove_item(&self.options.key).await
    }

    /// Persist on every burst of cache changes until the handle is stopped
    /// or dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn(&self) -> PersistHandle {
        let persister = self.clone();
        let mut events = self.cache.subscribe_events();
        let throttle = self.options.throttle;

        let task = tokio::spawn(async move {
            loop {
                if let Err(RecvError::Closed) = events.recv().await {
                    break;
                }
                tokio::time::sleep(throttle).await;

                // Everything that arrived during the wait is covered by
                // this write.
                let mut closed = false;
                loop {
                    match events.try_recv() {
                        Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Closed) => {
                            closed = true;
                            break;
                        }
                    }
                }

                if let Err(err) = persister.persist().await {
                    warn!(key = %persister.options.key, error = %err, "failed to persist cache");
                }
                if closed {
                    break;
                }
            }
        });

        PersistHandle { task }
    }
}

/// Background persistence started by [`Persister::spawn`]. Dropping the
/// handle stops it.
#[derive(Debug)]
pub struct PersistHandle {
    task: JoinHandle<()>,
}

impl PersistHandle {
    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for PersistHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Restore `cache` from `storage`, then keep storage up to date.
///
/// Restore failures are logged and the cache starts empty.
pub async fn persist_query_cache<T>(
    cache: &QueryCache<T>,
    storage: impl StorageAdapter + 'static,
    options: PersistOptions,
) -> PersistHandle
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let persister = Persister::new(cache, storage, options);
    persister.restore().await;
    persister.spawn()
}
