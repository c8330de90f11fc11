//! Query Cache
//!
//! A keyed cache of fetched data with freshness tracking and request
//! deduplication. Each key moves through
//!
//! ```text
//! absent -> pending -> fresh -> stale -> evicted
//!              |                  ^
//!              +--(failure)-------+ (or back to absent)
//! ```
//!
//! - **pending**: a shared future is installed under the cache lock. Every
//!   request for the same key while it is pending attaches to that future,
//!   so the fetch function runs once and every waiter sees the same result.
//! - **fresh/stale**: an entry is stale once more than `stale_time` has
//!   passed since it was written, or once it was invalidated.
//! - **evicted**: an entry older than `cache_time` is dropped on the next
//!   read of its key, or by [`QueryCache::evict_expired`] and the periodic
//!   sweep.
//!
//! A failed fetch writes nothing. A key that had data keeps it; a key that
//! had none stays absent, and the next request starts a new fetch.
//!
//! Fetches run on the ambient Tokio runtime when there is one, so they
//! complete and populate the cache even if every waiter is dropped. Outside
//! a runtime the fetch is driven by whichever waiter polls it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::QueryCacheConfig;
use crate::error::{BoxError, FetchError, QueryError};

use super::clock::{Clock, SystemClock};
use super::entry::{CacheEntry, DehydratedState, QueryOptions};
use super::key::QueryKey;

/// Boxed future returned by a type-erased fetch function.
pub type FetchFuture<T> = BoxFuture<'static, Result<T, BoxError>>;

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, FetchError>>>;

const EVENT_CAPACITY: usize = 256;

/// A change to the cache contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// An entry was written by `set`, a fetch, or hydration.
    Updated(QueryKey),
    /// An entry was removed or evicted.
    Removed(QueryKey),
    /// Entries under this prefix were marked stale.
    Invalidated(QueryKey),
    /// Every entry was dropped.
    Cleared,
}

/// Summary returned by [`QueryCache::get_stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub keys: Vec<String>,
}

/// A shared, cloneable query cache for values of type `T`.
///
/// # Example
///
/// ```rust
/// use filament_core::query::{QueryCache, QueryOptions};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cache: QueryCache<String> = QueryCache::default();
///
/// let name = cache
///     .fetch(["user", "1"], |_key| async { Ok::<_, std::io::Error>("Ada".to_string()) }, QueryOptions::new())
///     .await
///     .unwrap();
///
/// assert_eq!(name, "Ada");
/// assert_eq!(cache.get(&["user", "1"].into()), Some("Ada".to_string()));
/// # }
/// ```
pub struct QueryCache<T> {
    inner: Arc<CacheInner<T>>,
}

struct CacheInner<T> {
    state: Mutex<CacheState<T>>,
    config: QueryCacheConfig,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<CacheEvent>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
    next_request: AtomicU64,
}

struct CacheState<T> {
    entries: IndexMap<QueryKey, CacheEntry<T>>,
    in_flight: IndexMap<QueryKey, InFlight<T>>,
    /// Bumped by `clear`; results of fetches started in an older epoch are
    /// discarded.
    epoch: u64,
}

struct InFlight<T> {
    request: u64,
    future: SharedFetch<T>,
}

enum Lookup<T> {
    Ready(T),
    Pending(SharedFetch<T>),
}

impl<T> Drop for CacheInner<T> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}

impl<T> Clone for QueryCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for QueryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(QueryCacheConfig::default())
    }
}

impl<T> QueryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a cache using the system clock.
    ///
    /// If `config.sweep_interval` is set and a Tokio runtime is running, the
    /// eviction sweep starts immediately.
    pub fn new(config: QueryCacheConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }

    /// Create a cache reading time from `clock`.
    pub fn with_clock(config: QueryCacheConfig, clock: impl Clock) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let cache = Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState {
                    entries: IndexMap::new(),
                    in_flight: IndexMap::new(),
                    epoch: 0,
                }),
                config,
                clock: Arc::new(clock),
                events,
                sweeper: Mutex::new(None),
                destroyed: AtomicBool::new(false),
                next_request: AtomicU64::new(1),
            }),
        };

        if let Some(interval) = config.sweep_interval {
            if Handle::try_current().is_ok() {
                cache.start_sweep(interval);
            } else {
                debug!("no tokio runtime; eviction sweep not started");
            }
        }
        cache
    }

    fn upgrade(weak: &Weak<CacheInner<T>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &QueryCacheConfig {
        &self.inner.config
    }

    /// Current time in epoch milliseconds, according to the cache's clock.
    pub fn now_ms(&self) -> u64 {
        self.inner.clock.now_ms()
    }

    fn emit(&self, event: CacheEvent) {
        // No receivers is fine.
        let _ = self.inner.events.send(event);
    }

    /// Receive every subsequent [`CacheEvent`].
    pub fn subscribe_events(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Remove `key` if it has outlived its cache time. Returns whether it did.
    fn evict_if_expired(&self, state: &mut CacheState<T>, key: &QueryKey, now: u64) -> bool {
        let expired = state
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_expired(now));
        if expired {
            state.entries.shift_remove(key);
            trace!(key = %key, "evicted expired entry on access");
            self.emit(CacheEvent::Removed(key.clone()));
        }
        expired
    }

    /// The cached data for `key`, fresh or stale.
    ///
    /// An entry past its cache time is evicted instead of returned.
    pub fn get(&self, key: &QueryKey) -> Option<T> {
        self.get_entry(key).map(|entry| entry.data)
    }

    /// The cached entry for `key`, with its metadata.
    pub fn get_entry(&self, key: &QueryKey) -> Option<CacheEntry<T>> {
        let now = self.now_ms();
        let mut state = self.inner.state.lock();
        self.evict_if_expired(&mut state, key, now);
        state.entries.get(key).cloned()
    }

    /// Whether `key` needs fetching: absent, expired, or stale.
    pub fn is_stale(&self, key: &QueryKey) -> bool {
        let now = self.now_ms();
        let mut state = self.inner.state.lock();
        self.evict_if_expired(&mut state, key, now);
        state.entries.get(key).map_or(true, |entry| entry.is_stale(now))
    }

    /// Whether a fetch for `key` is pending.
    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        self.inner.state.lock().in_flight.contains_key(key)
    }

    fn resolve(&self, existing: Option<&CacheEntry<T>>, options: QueryOptions) -> (Duration, Option<Duration>) {
        let config = &self.inner.config;
        let stale_time = options
            .stale_time
            .or(existing.map(|e| e.stale_time))
            .unwrap_or(config.default_stale_time);
        let cache_time = options
            .cache_time
            .or(existing.map(|e| e.cache_time))
            .unwrap_or(config.default_cache_time);
        (stale_time, cache_time)
    }

    fn write(&self, state: &mut CacheState<T>, key: QueryKey, data: T, options: QueryOptions, now: u64) {
        let (stale_time, cache_time) = self.resolve(state.entries.get(&key), options);
        state.entries.insert(
            key.clone(),
            CacheEntry {
                key: key.clone(),
                data,
                timestamp: now,
                stale_time,
                cache_time,
                invalidated: false,
            },
        );
        self.emit(CacheEvent::Updated(key));
    }

    /// Store `data` under `key`, stamped with the current time.
    ///
    /// A pending fetch for the same key is not cancelled; whichever write
    /// lands last wins.
    pub fn set(&self, key: impl Into<QueryKey>, data: T, options: QueryOptions) {
        let key = key.into();
        let now = self.now_ms();
        trace!(key = %key, "set");
        let mut state = self.inner.state.lock();
        self.write(&mut state, key, data, options, now);
    }

    /// Remove `key`, returning its data.
    pub fn remove(&self, key: &QueryKey) -> Option<T> {
        let removed = self.inner.state.lock().entries.shift_remove(key)?;
        self.emit(CacheEvent::Removed(key.clone()));
        Some(removed.data)
    }

    /// Return fresh data for `key`, fetching it if it is absent or stale.
    ///
    /// Concurrent calls for the same key share one invocation of `fetcher`.
    /// The fetch function is called while the cache is locked: it may build
    /// a future that uses the cache, but must not call into the cache
    /// itself before returning.
    pub async fn fetch<F, Fut, E>(&self, key: impl Into<QueryKey>, fetcher: F, options: QueryOptions) -> Result<T, QueryError>
    where
        F: FnOnce(QueryKey) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        match self.lookup(key.into(), fetcher, options, false)? {
            Lookup::Ready(data) => Ok(data),
            Lookup::Pending(pending) => Ok(pending.await?),
        }
    }

    /// Fetch `key` regardless of freshness.
    ///
    /// Still joins a pending fetch instead of starting a second one.
    pub async fn refetch<F, Fut, E>(&self, key: impl Into<QueryKey>, fetcher: F, options: QueryOptions) -> Result<T, QueryError>
    where
        F: FnOnce(QueryKey) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        match self.lookup(key.into(), fetcher, options, true)? {
            Lookup::Ready(data) => Ok(data),
            Lookup::Pending(pending) => Ok(pending.await?),
        }
    }

    fn lookup<F, Fut, E>(&self, key: QueryKey, fetcher: F, options: QueryOptions, force: bool) -> Result<Lookup<T>, QueryError>
    where
        F: FnOnce(QueryKey) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(QueryError::Destroyed);
        }

        let now = self.now_ms();
        let mut state = self.inner.state.lock();
        self.evict_if_expired(&mut state, &key, now);

        if !force {
            if let Some(entry) = state.entries.get(&key).filter(|e| !e.is_stale(now)) {
                trace!(key = %key, "fresh hit");
                return Ok(Lookup::Ready(entry.data.clone()));
            }
        }

        if let Some(pending) = state.in_flight.get(&key) {
            trace!(key = %key, request = pending.request, "joining pending fetch");
            return Ok(Lookup::Pending(pending.future.clone()));
        }

        let request = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
        let future = self.start_fetch(key.clone(), request, state.epoch, fetcher(key.clone()), options);
        state.in_flight.insert(
            key,
            InFlight {
                request,
                future: future.clone(),
            },
        );
        Ok(Lookup::Pending(future))
    }

    fn start_fetch<Fut, E>(&self, key: QueryKey, request: u64, epoch: u64, fetch: Fut, options: QueryOptions) -> SharedFetch<T>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        debug!(key = %key, request, "fetch started");

        let guard = PendingGuard {
            cache: Arc::downgrade(&self.inner),
            key: key.clone(),
            request,
        };
        let task = async move {
            let result = fetch
                .await
                .map_err(|err| FetchError::failed(guard.key.clone(), err.into()));
            if let Some(cache) = QueryCache::upgrade(&guard.cache) {
                cache.settle(&guard.key, request, epoch, &result, options);
            }
            drop(guard);
            result
        };

        let future = match Handle::try_current() {
            Ok(handle) => {
                let join = handle.spawn(task);
                async move {
                    join.await
                        .unwrap_or_else(|_| Err(FetchError::Aborted { key }))
                }
                .boxed()
            }
            Err(_) => task.boxed(),
        };
        future.shared()
    }

    fn settle(&self, key: &QueryKey, request: u64, epoch: u64, result: &Result<T, FetchError>, options: QueryOptions) {
        let now = self.now_ms();
        let mut state = self.inner.state.lock();
        let finished = take_pending(&mut state, key, request);

        if state.epoch != epoch {
            debug!(key = %key, request, "discarding result of fetch started before clear");
        } else {
            match result {
                Ok(data) => {
                    debug!(key = %key, request, "fetch succeeded");
                    self.write(&mut state, key.clone(), data.clone(), options, now);
                }
                Err(err) => {
                    debug!(key = %key, request, error = %err, "fetch failed");
                }
            }
        }

        drop(state);
        drop(finished);
    }

    /// Mark every entry whose key starts with `prefix` as stale.
    ///
    /// Data is kept and still served by [`get`](Self::get). Returns the
    /// number of entries hit.
    pub fn invalidate(&self, prefix: impl Into<QueryKey>) -> usize {
        let prefix = prefix.into();
        let mut hit = 0;
        {
            let mut state = self.inner.state.lock();
            for entry in state.entries.values_mut() {
                if entry.key.starts_with(&prefix) {
                    entry.invalidated = true;
                    hit += 1;
                }
            }
        }
        debug!(prefix = %prefix, hit, "invalidated");
        self.emit(CacheEvent::Invalidated(prefix));
        hit
    }

    /// Drop every entry past its cache time. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = self.now_ms();
        let expired: Vec<QueryKey> = {
            let mut state = self.inner.state.lock();
            let expired: Vec<QueryKey> = state
                .entries
                .values()
                .filter(|entry| entry.is_expired(now))
                .map(|entry| entry.key.clone())
                .collect();
            for key in &expired {
                state.entries.shift_remove(key);
            }
            expired
        };

        if !expired.is_empty() {
            debug!(count = expired.len(), "evicted expired entries");
        }
        let count = expired.len();
        for key in expired {
            self.emit(CacheEvent::Removed(key));
        }
        count
    }

    /// Run [`evict_expired`](Self::evict_expired) every `interval` on the
    /// current Tokio runtime, replacing any previous sweep.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start_sweep(&self, interval: Duration) {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = QueryCache::upgrade(&weak) else {
                    break;
                };
                cache.evict_expired();
            }
        });
        if let Some(previous) = self.inner.sweeper.lock().replace(task) {
            previous.abort();
        }
    }

    /// Every entry keyed by its stringified key. Expired entries are
    /// included; nothing is evicted.
    pub fn get_all(&self) -> IndexMap<String, CacheEntry<T>> {
        self.inner
            .state
            .lock()
            .entries
            .iter()
            .map(|(key, entry)| (key.to_string(), entry.clone()))
            .collect()
    }

    pub fn get_stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        CacheStats {
            size: state.entries.len(),
            keys: state.entries.keys().map(ToString::to_string).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and forget pending fetches.
    ///
    /// Fetches already running still complete for their waiters, but their
    /// results are not written.
    pub fn clear(&self) {
        let abandoned = {
            let mut state = self.inner.state.lock();
            state.entries.clear();
            state.epoch += 1;
            std::mem::take(&mut state.in_flight)
        };
        drop(abandoned);
        debug!("cache cleared");
        self.emit(CacheEvent::Cleared);
    }

    /// Clear the cache, stop the sweep and refuse further fetches.
    pub fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::Release);
        if let Some(sweeper) = self.inner.sweeper.lock().take() {
            sweeper.abort();
        }
        self.clear();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Snapshot of every unexpired entry.
    pub fn dehydrate(&self) -> DehydratedState<T> {
        let now = self.now_ms();
        let state = self.inner.state.lock();
        DehydratedState {
            queries: state
                .entries
                .values()
                .filter(|entry| !entry.is_expired(now))
                .map(CacheEntry::dehydrate)
                .collect(),
        }
    }

    /// Load entries from a snapshot, keeping their original timestamps.
    ///
    /// Entries older than `max_age`, past their own cache time, or older
    /// than what the cache already holds for the same key are skipped.
    /// Returns the number of entries written.
    pub fn hydrate(&self, snapshot: DehydratedState<T>, max_age: Option<Duration>) -> usize {
        let now = self.now_ms();
        let mut written = Vec::new();
        {
            let mut state = self.inner.state.lock();
            for query in snapshot.queries {
                let entry = query.into_entry();
                if max_age.is_some_and(|max_age| entry.age(now) > max_age) || entry.is_expired(now) {
                    trace!(key = %entry.key, "skipping expired dehydrated entry");
                    continue;
                }
                if state
                    .entries
                    .get(&entry.key)
                    .is_some_and(|existing| existing.timestamp >= entry.timestamp)
                {
                    trace!(key = %entry.key, "keeping newer cached entry");
                    continue;
                }
                written.push(entry.key.clone());
                state.entries.insert(entry.key.clone(), entry);
            }
        }

        debug!(count = written.len(), "hydrated cache");
        let count = written.len();
        for key in written {
            self.emit(CacheEvent::Updated(key));
        }
        count
    }
}

/// Clears the pending marker of a fetch task when the task ends, including
/// when it panics.
struct PendingGuard<T> {
    cache: Weak<CacheInner<T>>,
    key: QueryKey,
    request: u64,
}

impl<T> Drop for PendingGuard<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.cache.upgrade() {
            let finished = take_pending(&mut inner.state.lock(), &self.key, self.request);
            drop(finished);
        }
    }
}

/// Remove the pending marker for `key` if it still belongs to `request`.
///
/// The returned marker may hold the last reference to a fetch future whose
/// drop re-enters the cache, so callers drop it after unlocking.
fn take_pending<T>(state: &mut CacheState<T>, key: &QueryKey, request: u64) -> Option<InFlight<T>> {
    if state.in_flight.get(key).is_some_and(|p| p.request == request) {
        state.in_flight.shift_remove(key)
    } else {
        None
    }
}
