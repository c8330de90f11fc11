//! Cache entries and their serialized form.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{millis, optional_millis};

use super::key::QueryKey;

/// Per-call overrides for freshness and retention.
///
/// Unset fields fall back to the existing entry's settings, then to the
/// cache's [`QueryCacheConfig`](crate::config::QueryCacheConfig).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// How long data counts as fresh after it was written.
    pub stale_time: Option<Duration>,
    /// How long data is retained after it was written. `Some(None)` keeps
    /// it forever.
    pub cache_time: Option<Option<Duration>>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = Some(Some(cache_time));
        self
    }

    /// Never evict the entry.
    pub fn keep_forever(mut self) -> Self {
        self.cache_time = Some(None);
        self
    }
}

/// A cached value with its freshness metadata.
///
/// Times are epoch milliseconds from the cache's [`Clock`](super::Clock).
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub key: QueryKey,
    pub data: T,
    pub timestamp: u64,
    pub stale_time: Duration,
    /// `None` means the entry is never evicted.
    pub cache_time: Option<Duration>,
    /// Set by `invalidate`; cleared by the next successful write.
    pub invalidated: bool,
}

impl<T> CacheEntry<T> {
    /// Time elapsed since the entry was written. Zero if the clock went
    /// backwards.
    pub fn age(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.timestamp))
    }

    pub fn is_stale(&self, now_ms: u64) -> bool {
        self.invalidated || self.age(now_ms) > self.stale_time
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        match self.cache_time {
            Some(cache_time) => self.age(now_ms) > cache_time,
            None => false,
        }
    }

    pub(crate) fn dehydrate(&self) -> DehydratedQuery<T>
    where
        T: Clone,
    {
        DehydratedQuery {
            query_key: self.key.clone(),
            data: self.data.clone(),
            timestamp: self.timestamp,
            stale_time: self.stale_time,
            cache_time: self.cache_time,
            is_invalidated: self.invalidated,
        }
    }
}

/// One entry of a [`DehydratedState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedQuery<T> {
    pub query_key: QueryKey,
    pub data: T,
    pub timestamp: u64,
    #[serde(with = "millis", default)]
    pub stale_time: Duration,
    #[serde(with = "optional_millis", default)]
    pub cache_time: Option<Duration>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_invalidated: bool,
}

impl<T> DehydratedQuery<T> {
    pub(crate) fn into_entry(self) -> CacheEntry<T> {
        CacheEntry {
            key: self.query_key,
            data: self.data,
            timestamp: self.timestamp,
            stale_time: self.stale_time,
            cache_time: self.cache_time,
            invalidated: self.is_invalidated,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Serializable snapshot of a cache, in cache insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DehydratedState<T> {
    pub queries: Vec<DehydratedQuery<T>>,
}

impl<T> Default for DehydratedState<T> {
    fn default() -> Self {
        Self { queries: Vec::new() }
    }
}

impl<T> DehydratedState<T> {
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(timestamp: u64, stale_ms: u64, cache_ms: Option<u64>) -> CacheEntry<u32> {
        CacheEntry {
            key: QueryKey::from(["k"]),
            data: 1,
            timestamp,
            stale_time: Duration::from_millis(stale_ms),
            cache_time: cache_ms.map(Duration::from_millis),
            invalidated: false,
        }
    }

    #[test]
    fn staleness_follows_elapsed_time() {
        let e = entry(1_000, 100, None);
        assert!(!e.is_stale(1_000));
        assert!(!e.is_stale(1_100));
        assert!(e.is_stale(1_101));
    }

    #[test]
    fn zero_stale_time_goes_stale_after_any_elapsed_time() {
        let e = entry(1_000, 0, None);
        assert!(!e.is_stale(1_000));
        assert!(e.is_stale(1_001));
    }

    #[test]
    fn invalidated_entry_is_stale_immediately() {
        let mut e = entry(1_000, 60_000, None);
        e.invalidated = true;
        assert!(e.is_stale(1_000));
    }

    #[test]
    fn expiry_needs_a_cache_time() {
        assert!(!entry(0, 0, None).is_expired(u64::MAX));

        let e = entry(1_000, 0, Some(500));
        assert!(!e.is_expired(1_500));
        assert!(e.is_expired(1_501));
    }

    #[test]
    fn clock_going_backwards_is_not_stale() {
        let e = entry(5_000, 10, Some(10));
        assert!(!e.is_stale(4_000));
        assert!(!e.is_expired(4_000));
    }

    #[test]
    fn options_builder() {
        let options = QueryOptions::new()
            .stale_time(Duration::from_secs(1))
            .keep_forever();
        assert_eq!(options.stale_time, Some(Duration::from_secs(1)));
        assert_eq!(options.cache_time, Some(None));
    }

    #[test]
    fn dehydrated_query_wire_format() {
        let query = entry(42, 100, None).dehydrate();
        let value = serde_json::to_value(&query).unwrap();

        assert_eq!(
            value,
            json!({
                "queryKey": ["k"],
                "data": 1,
                "timestamp": 42,
                "staleTime": 100,
                "cacheTime": null
            })
        );

        let parsed: DehydratedQuery<u32> =
            serde_json::from_value(json!({ "queryKey": ["k"], "data": 1, "timestamp": 42 })).unwrap();
        assert_eq!(parsed.stale_time, Duration::ZERO);
        assert_eq!(parsed.cache_time, None);
        assert!(!parsed.is_invalidated);
    }
}
