//! Query observers.
//!
//! A [`Query`] binds one key of a [`QueryCache`] to a fetch function and
//! exposes the result as a reactive [`Signal`] of [`QueryState`]. Reading
//! [`Query::state`] inside a computed or effect tracks it like any signal.
//!
//! While the query has at least one subscription it keeps itself current
//! from a background task: it fetches once if the cached data is stale,
//! refetches when its key is invalidated or on the optional interval, and
//! picks up writes made to its key by anyone else. The task stops when the
//! last subscription is removed.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tracing::{debug, trace};

use crate::error::{BoxError, QueryError};
use crate::reactive::{untrack, Signal, Subscription};

use super::cache::{CacheEvent, FetchFuture, QueryCache};
use super::entry::{CacheEntry, QueryOptions};
use super::key::QueryKey;

type Fetcher<T> = Arc<dyn Fn(QueryKey) -> FetchFuture<T> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// Nothing fetched yet.
    Idle,
    /// First fetch in progress.
    Loading,
    Success,
    /// The last fetch failed. Earlier data, if any, is still in `data`.
    Error,
}

/// Snapshot of a query, as seen by readers and subscribers.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
    pub status: QueryStatus,
    pub data: Option<T>,
    pub error: Option<QueryError>,
    /// A fetch is running, including background refetches of existing data.
    pub is_fetching: bool,
    /// Cache timestamp of `data`.
    pub updated_at: Option<u64>,
}

impl<T> QueryState<T> {
    fn idle() -> Self {
        Self {
            status: QueryStatus::Idle,
            data: None,
            error: None,
            is_fetching: false,
            updated_at: None,
        }
    }

    fn from_entry(entry: CacheEntry<T>) -> Self {
        Self {
            status: QueryStatus::Success,
            data: Some(entry.data),
            error: None,
            is_fetching: false,
            updated_at: Some(entry.timestamp),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }
}

/// Settings for a [`Query`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryObserverOptions {
    pub query: QueryOptions,
    /// Refetch this often while subscribed.
    pub refetch_interval: Option<Duration>,
}

impl QueryObserverOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, query: QueryOptions) -> Self {
        self.query = query;
        self
    }

    pub fn refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }
}

/// A cached query with reactive state.
pub struct Query<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<QueryInner<T>>,
}

struct QueryInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    cache: QueryCache<T>,
    key: QueryKey,
    fetcher: Fetcher<T>,
    options: QueryObserverOptions,
    state: Signal<QueryState<T>>,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl<T> Drop for QueryInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(task) = self.background.get_mut().take() {
            task.abort();
        }
    }
}

enum Wake {
    Refetch,
    Sync,
    Ignore,
    Stop,
}

impl<T> Query<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Observe `key` in `cache`, fetching with `fetcher` when needed.
    ///
    /// The initial state reflects whatever the cache holds for `key`; no
    /// fetch starts until [`fetch`](Self::fetch) is called or the first
    /// subscription is added.
    pub fn new<F, Fut, E>(cache: &QueryCache<T>, key: impl Into<QueryKey>, fetcher: F, options: QueryObserverOptions) -> Self
    where
        F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let key = key.into();
        let fetcher: Fetcher<T> = Arc::new(move |key| {
            let request = fetcher(key);
            async move { request.await.map_err(Into::<BoxError>::into) }.boxed()
        });
        let initial = cache
            .get_entry(&key)
            .map_or_else(QueryState::idle, QueryState::from_entry);

        let inner = Arc::new_cyclic(|weak: &Weak<QueryInner<T>>| {
            let state = Signal::new(initial);

            let on = weak.clone();
            state.on_active(move || {
                if let Some(query) = on.upgrade() {
                    QueryInner::start_background(&query);
                }
            });
            let off = weak.clone();
            state.on_inactive(move || {
                if let Some(query) = off.upgrade() {
                    query.stop_background();
                }
            });

            QueryInner {
                cache: cache.clone(),
                key,
                fetcher,
                options,
                state,
                background: Mutex::new(None),
            }
        });

        Self { inner }
    }

    pub fn key(&self) -> &QueryKey {
        &self.inner.key
    }

    /// Current state. Tracked.
    pub fn state(&self) -> QueryState<T> {
        self.inner.state.get()
    }

    /// Current data. Tracked.
    pub fn data(&self) -> Option<T> {
        self.inner.state.with(|state| state.data.clone())
    }

    /// The underlying state signal.
    pub fn signal(&self) -> &Signal<QueryState<T>> {
        &self.inner.state
    }

    /// Return fresh data, fetching through the cache if it is stale.
    pub async fn fetch(&self) -> Result<T, QueryError> {
        self.inner.run(false).await
    }

    /// Fetch regardless of freshness.
    pub async fn refetch(&self) -> Result<T, QueryError> {
        self.inner.run(true).await
    }

    /// Call `callback` with every new state. The first subscription starts
    /// background refreshing.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&QueryState<T>) + Send + Sync + 'static,
    {
        self.inner.state.subscribe(callback)
    }

    /// Whether the background task is running.
    pub fn is_active(&self) -> bool {
        self.inner
            .background
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl<T> Clone for Query<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> QueryInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn run(&self, force: bool) -> Result<T, QueryError> {
        if !force && !self.cache.is_stale(&self.key) {
            if let Some(entry) = self.cache.get_entry(&self.key) {
                let data = entry.data.clone();
                self.apply_entry(entry);
                return Ok(data);
            }
        }

        self.state.update_in_place(|state| {
            state.is_fetching = true;
            if state.data.is_none() {
                state.status = QueryStatus::Loading;
            }
        });

        let fetcher = Arc::clone(&self.fetcher);
        let fetch = move |key| fetcher(key);
        let result = if force {
            self.cache.refetch(self.key.clone(), fetch, self.options.query).await
        } else {
            self.cache.fetch(self.key.clone(), fetch, self.options.query).await
        };

        match &result {
            Ok(data) => {
                let updated_at = self.cache.get_entry(&self.key).map(|entry| entry.timestamp);
                let data = data.clone();
                self.state.update_in_place(|state| {
                    state.status = QueryStatus::Success;
                    state.data = Some(data);
                    state.error = None;
                    state.is_fetching = false;
                    state.updated_at = updated_at.or(state.updated_at);
                });
            }
            Err(err) => {
                debug!(key = %self.key, error = %err, "query fetch failed");
                let err = err.clone();
                self.state.update_in_place(|state| {
                    state.status = QueryStatus::Error;
                    state.error = Some(err);
                    state.is_fetching = false;
                });
            }
        }
        result
    }

    /// Entries are told apart by timestamp; a write carrying the timestamp
    /// already shown is not applied again.
    fn apply_entry(&self, entry: CacheEntry<T>) {
        let current = untrack(|| self.state.with(|state| state.updated_at));
        if current == Some(entry.timestamp) {
            return;
        }
        self.state.update_in_place(|state| {
            state.status = QueryStatus::Success;
            state.data = Some(entry.data);
            state.error = None;
            state.updated_at = Some(entry.timestamp);
        });
    }

    fn sync_from_cache(&self) {
        if let Some(entry) = self.cache.get_entry(&self.key) {
            self.apply_entry(entry);
        }
    }

    fn start_background(self: &Arc<Self>) {
        let Ok(handle) = Handle::try_current() else {
            debug!(key = %self.key, "no tokio runtime; query will not refresh in the background");
            return;
        };

        let weak = Arc::downgrade(self);
        let key = self.key.clone();
        let mut events = self.cache.subscribe_events();
        let period = self.options.refetch_interval;

        let task = handle.spawn(async move {
            if let Some(query) = weak.upgrade() {
                if query.cache.is_stale(&query.key) {
                    let _ = query.run(false).await;
                }
            }

            let mut ticker = period.map(|period| tokio::time::interval_at(Instant::now() + period, period));
            loop {
                let wake = tokio::select! {
                    event = events.recv() => match event {
                        Ok(CacheEvent::Invalidated(prefix)) if key.starts_with(&prefix) => Wake::Refetch,
                        Ok(CacheEvent::Updated(updated)) if updated == key => Wake::Sync,
                        Ok(_) => Wake::Ignore,
                        Err(RecvError::Lagged(skipped)) => {
                            trace!(key = %key, skipped, "query lagged behind cache events");
                            Wake::Sync
                        }
                        Err(RecvError::Closed) => Wake::Stop,
                    },
                    _ = next_tick(&mut ticker) => Wake::Refetch,
                };

                let Some(query) = weak.upgrade() else {
                    break;
                };
                match wake {
                    Wake::Refetch => {
                        trace!(key = %key, "background refetch");
                        let _ = query.run(true).await;
                    }
                    Wake::Sync => query.sync_from_cache(),
                    Wake::Ignore => {}
                    Wake::Stop => break,
                }
            }
        });

        if let Some(previous) = self.background.lock().replace(task) {
            previous.abort();
        }
        debug!(key = %self.key, "query activated");
    }

    fn stop_background(&self) {
        if let Some(task) = self.background.lock().take() {
            task.abort();
            debug!(key = %self.key, "query deactivated");
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
