//! Error types.
//!
//! Errors are split by who has to deal with them. [`ReactiveError`] and
//! [`FetchError`] reach the caller. [`HydrationError`] and [`PersistError`]
//! are bookkeeping failures: the persistence bridge logs them and carries on
//! as if nothing had been cached.

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

use crate::query::QueryKey;

/// Boxed error returned by caller-supplied fetch functions.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Errors raised by reactive values and stores.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReactiveError {
    /// Attempted write to a derived value (computed or store getter).
    #[error("cannot write to {target}: derived values are read-only")]
    ImmutableTarget { target: String },

    /// `dispatch` named an action the store does not have.
    #[error("store {store} has no action named `{name}`")]
    UnknownAction { store: String, name: String },

    /// A property value could not be converted to or from the requested type.
    #[error("property `{key}` could not be converted: {message}")]
    Serialization { key: String, message: String },
}

/// A fetch failed.
///
/// Cloneable because every waiter attached to the same in-flight request
/// receives its own copy of the one failure.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The fetch function returned an error.
    #[error("fetch for {key} failed: {source}")]
    Failed {
        key: QueryKey,
        #[source]
        source: Arc<dyn StdError + Send + Sync>,
    },

    /// The spawned fetch task panicked or was aborted.
    #[error("fetch task for {key} did not complete")]
    Aborted { key: QueryKey },
}

impl FetchError {
    pub(crate) fn failed(key: QueryKey, source: BoxError) -> Self {
        FetchError::Failed {
            key,
            source: Arc::from(source),
        }
    }

    /// The key whose fetch failed.
    pub fn key(&self) -> &QueryKey {
        match self {
            FetchError::Failed { key, .. } | FetchError::Aborted { key } => key,
        }
    }
}

/// Errors returned by [`QueryCache`](crate::query::QueryCache) fetches.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The cache was destroyed before or while the request was made.
    #[error("query cache has been destroyed")]
    Destroyed,
}

/// Errors reported by a storage adapter.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend refused or failed the operation.
    #[error("storage backend failure: {0}")]
    Backend(String),

    /// An I/O error from a file- or socket-backed adapter.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Restoring persisted state failed; treated as a cold start.
#[derive(Debug, Error)]
pub enum HydrationError {
    /// The blob is not valid JSON of the expected shape.
    #[error("persisted state is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The blob is older than the configured maximum age.
    #[error("persisted state expired: age {age_ms}ms exceeds max {max_age_ms}ms")]
    Expired { age_ms: u64, max_age_ms: u64 },

    /// The blob was written with a different buster token.
    #[error("persisted state buster `{found}` does not match `{expected}`")]
    BusterMismatch { expected: String, found: String },

    /// The adapter could not be read.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Writing the cache to storage failed; never retried.
#[derive(Debug, Error)]
pub enum PersistError {
    /// The cache contents could not be serialized.
    #[error("could not serialize cache: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The adapter rejected the write.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_error_keeps_key_and_source() {
        let key = QueryKey::from(["users", "1"]);
        let err = FetchError::failed(key.clone(), "connection reset".into());

        assert_eq!(err.key(), &key);
        assert!(err.to_string().contains("connection reset"));
        assert!(err.source().is_some());
    }

    #[test]
    fn fetch_error_clones_share_source() {
        let err = FetchError::failed(QueryKey::from(["a"]), "boom".into());
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
    }

    #[test]
    fn immutable_target_names_target() {
        let err = ReactiveError::ImmutableTarget {
            target: "computed #3".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "cannot write to computed #3: derived values are read-only"
        );
    }
}
