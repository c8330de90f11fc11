//! Integration Tests for the Query Cache

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use filament_core::config::QueryCacheConfig;
use filament_core::error::QueryError;
use filament_core::query::{ManualClock, Query, QueryCache, QueryKey, QueryObserverOptions, QueryOptions};
use filament_core::reactive::{Computed, Effect};
use futures_util::future::join_all;

fn cache_with_clock() -> (ManualClock, QueryCache<String>) {
    let clock = ManualClock::new(0);
    let cache = QueryCache::with_clock(QueryCacheConfig::default(), clock.clone());
    (clock, cache)
}

/// Many concurrent requests for one key share a single fetch.
///
/// The fetch is held open until every request has attached to it, so a
/// second fetch could only come from a missed in-flight marker.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_are_deduplicated() {
    let (_, cache) = cache_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));
    let (release, gate) = tokio::sync::oneshot::channel::<()>();
    let gate = Arc::new(tokio::sync::Mutex::new(Some(gate)));

    let requests = (0..16).map(|_| {
        let (cache, calls, gate) = (cache.clone(), calls.clone(), gate.clone());
        async move {
            cache
                .fetch(
                    ["users", "1"],
                    move |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        if let Some(gate) = gate.lock().await.take() {
                            let _ = gate.await;
                        }
                        Ok::<_, io::Error>("ada".to_string())
                    },
                    QueryOptions::new(),
                )
                .await
        }
    });
    // `join_all` polls every request once before any can finish.
    let all = tokio::spawn(join_all(requests));

    while !cache.is_fetching(&["users", "1"].into()) {
        tokio::task::yield_now().await;
    }
    release.send(()).unwrap();

    let results = all.await.unwrap();
    assert_eq!(results.len(), 16);
    for result in results {
        assert_eq!(result.unwrap(), "ada");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!cache.is_fetching(&["users", "1"].into()));
}

/// Every waiter of a failed fetch sees the failure, and nothing is cached.
#[tokio::test]
async fn failure_reaches_every_waiter() {
    let (_, cache) = cache_with_clock();
    let (release, gate) = tokio::sync::oneshot::channel::<()>();
    let gate = Arc::new(tokio::sync::Mutex::new(Some(gate)));

    let fetch = |cache: QueryCache<String>, gate: Arc<tokio::sync::Mutex<Option<tokio::sync::oneshot::Receiver<()>>>>| async move {
        cache
            .fetch(
                ["flaky"],
                move |_| async move {
                    if let Some(gate) = gate.lock().await.take() {
                        let _ = gate.await;
                    }
                    Err::<String, _>(io::Error::new(io::ErrorKind::TimedOut, "timed out"))
                },
                QueryOptions::new(),
            )
            .await
    };

    let first = tokio::spawn(fetch(cache.clone(), gate.clone()));
    let second = tokio::spawn(fetch(cache.clone(), gate.clone()));
    while !cache.is_fetching(&["flaky"].into()) {
        tokio::task::yield_now().await;
    }
    release.send(()).unwrap();

    for waiter in [first, second] {
        match waiter.await.unwrap() {
            Err(QueryError::Fetch(err)) => assert_eq!(err.key(), &QueryKey::from(["flaky"])),
            other => panic!("expected fetch error, got {other:?}"),
        }
    }
    assert!(cache.get(&["flaky"].into()).is_none());
}

/// Once stale, an entry stays stale until written again.
#[test]
fn staleness_is_monotonic() {
    let (clock, cache) = cache_with_clock();
    let key = QueryKey::from(["report"]);
    cache.set(key.clone(), "v1".into(), QueryOptions::new().stale_time(Duration::from_secs(30)));

    let mut became_stale = false;
    for _ in 0..60 {
        clock.advance(Duration::from_secs(1));
        let stale = cache.is_stale(&key);
        assert!(!(became_stale && !stale), "entry became fresh without a write");
        became_stale |= stale;
    }
    assert!(became_stale);

    cache.set(key.clone(), "v2".into(), QueryOptions::new());
    assert!(!cache.is_stale(&key));
}

/// Entries disappear after their cache time without being written.
#[test]
fn eviction_after_cache_time() {
    let (clock, cache) = cache_with_clock();
    cache.set(["session"], "token".into(), QueryOptions::new().cache_time(Duration::from_secs(300)));

    clock.advance(Duration::from_secs(299));
    assert_eq!(cache.get(&["session"].into()), Some("token".to_string()));

    clock.advance(Duration::from_secs(2));
    assert_eq!(cache.evict_expired(), 1);
    assert!(cache.is_empty());
}

#[test]
fn invalidate_by_prefix_hits_only_matching_keys() {
    let (_, cache) = cache_with_clock();
    let fresh = QueryOptions::new().stale_time(Duration::from_secs(3600));
    cache.set(["users", "1"], "ada".into(), fresh);
    cache.set(["users", "2"], "grace".into(), fresh);
    cache.set(["posts", "1"], "hello".into(), fresh);

    cache.invalidate(["users"]);

    let stale: Vec<bool> = [["users", "1"], ["users", "2"], ["posts", "1"]]
        .into_iter()
        .map(|key| cache.is_stale(&key.into()))
        .collect();
    assert_eq!(stale, vec![true, true, false]);
}

/// A refetch after invalidation serves the old data until the new data
/// lands.
#[tokio::test]
async fn stale_while_revalidate() {
    let (_, cache) = cache_with_clock();
    cache.set(["feed"], "old".into(), QueryOptions::new().stale_time(Duration::from_secs(60)));
    cache.invalidate(["feed"]);

    let (release, gate) = tokio::sync::oneshot::channel::<()>();
    let refetch = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .fetch(
                    ["feed"],
                    move |_| async move {
                        let _ = gate.await;
                        Ok::<_, io::Error>("new".to_string())
                    },
                    QueryOptions::new(),
                )
                .await
        })
    };
    while !cache.is_fetching(&["feed"].into()) {
        tokio::task::yield_now().await;
    }

    assert_eq!(cache.get(&["feed"].into()), Some("old".to_string()));
    release.send(()).unwrap();
    assert_eq!(refetch.await.unwrap().unwrap(), "new");
    assert_eq!(cache.get(&["feed"].into()), Some("new".to_string()));
    assert!(!cache.is_stale(&["feed"].into()));
}

/// A `set` made while a fetch is pending is visible immediately and then
/// replaced by the fetch result, which completes last.
#[tokio::test]
async fn set_during_pending_fetch_last_completion_wins() {
    let (_, cache) = cache_with_clock();
    let (release, gate) = tokio::sync::oneshot::channel::<()>();

    let fetch = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .fetch(
                    ["k"],
                    move |_| async move {
                        let _ = gate.await;
                        Ok::<_, io::Error>("fetched".to_string())
                    },
                    QueryOptions::new(),
                )
                .await
        })
    };
    while !cache.is_fetching(&["k"].into()) {
        tokio::task::yield_now().await;
    }

    cache.set(["k"], "set".into(), QueryOptions::new());
    assert_eq!(cache.get(&["k"].into()), Some("set".to_string()));

    release.send(()).unwrap();
    assert_eq!(fetch.await.unwrap().unwrap(), "fetched");
    assert_eq!(cache.get(&["k"].into()), Some("fetched".to_string()));
}

/// Query state is an ordinary reactive value.
#[tokio::test]
async fn query_state_drives_computeds() {
    let (_, cache) = cache_with_clock();
    let query = Query::new(
        &cache,
        ["greeting"],
        |_| async { Ok::<_, io::Error>("hello".to_string()) },
        QueryObserverOptions::new(),
    );

    let q = query.clone();
    let length = Computed::new(move || q.data().map_or(0, |s| s.len()));

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let (l, out) = (length.clone(), seen.clone());
    let _effect = Effect::new(move || out.lock().push(l.get()));

    query.fetch().await.unwrap();

    assert_eq!(*seen.lock(), vec![0, 5]);
}
