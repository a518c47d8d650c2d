use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Value};
use vantage_cache::{
    cache_key, CacheKey, FetchError, Mutation, MutationCoordinator, MutationError, QueryCache,
    QueryStatus,
};
use vantage_test_utils::{fixtures, CallCounter, Gate};

fn gated_fetcher(
    counter: &CallCounter,
    gate: &Gate,
    value: Value,
) -> impl Fn() -> BoxFuture<'static, Result<Value, FetchError>> + Send + Sync + 'static {
    let counter = counter.clone();
    let gate = gate.clone();
    move || {
        let counter = counter.clone();
        let gate = gate.clone();
        let value = value.clone();
        async move {
            counter.hit();
            gate.wait().await;
            Ok(value)
        }
        .boxed()
    }
}

fn counting_fetcher(
    counter: &CallCounter,
    value: Value,
) -> impl Fn() -> futures_util::future::Ready<Result<Value, FetchError>> + Send + Sync + 'static {
    let counter = counter.clone();
    move || {
        counter.hit();
        futures_util::future::ready(Ok(value.clone()))
    }
}

async fn settle_background(counter: &CallCounter, expected: usize) {
    for _ in 0..50 {
        if counter.count() >= expected {
            break;
        }
        tokio::task::yield_now().await;
    }
    // Let the fetch that was just counted land.
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn concurrent_ensures_share_one_fetch() {
    let cache: QueryCache<Value> = QueryCache::default();
    let key = cache_key!["projectServices", fixtures::PROJECT_ID];
    let counter = CallCounter::new();
    let gate = Gate::new();

    let (first, second, ()) = tokio::join!(
        cache.ensure(key.clone(), gated_fetcher(&counter, &gate, fixtures::project_services())),
        cache.ensure(key.clone(), gated_fetcher(&counter, &gate, json!("never fetched"))),
        async {
            tokio::task::yield_now().await;
            assert_eq!(cache.get(&key).map(|e| e.status), Some(QueryStatus::Loading));
            gate.open();
        },
    );

    assert_eq!(counter.count(), 1);
    assert_eq!(first.unwrap().into_value(), fixtures::project_services());
    assert_eq!(second.unwrap().into_value(), fixtures::project_services());
    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.joined, 1);
}

#[tokio::test]
async fn failed_refetch_keeps_last_good_value() {
    let cache: QueryCache<Value> = QueryCache::default();
    let key = cache_key!["projectReviews", fixtures::PROJECT_ID];
    cache
        .ensure(key.clone(), || async { Ok::<_, FetchError>(fixtures::project_reviews()) })
        .await
        .unwrap();
    cache.invalidate_prefix(&cache_key!["projectReviews"]);

    let err = cache
        .ensure(key.clone(), || async {
            Err::<Value, _>(FetchError::network("connection refused"))
        })
        .await
        .unwrap_err();

    let entry = cache.get(&key).unwrap();
    assert_eq!(entry.status, QueryStatus::Error);
    assert_eq!(entry.value, Some(fixtures::project_reviews()));
    assert_eq!(entry.error, Some(err));
}

#[tokio::test]
async fn watched_keys_refetch_after_invalidation() {
    let cache: QueryCache<Value> = QueryCache::default();
    let key = cache_key!["projectTasks", fixtures::PROJECT_ID];
    let counter = CallCounter::new();

    let watch = cache.watch(key.clone(), counting_fetcher(&counter, json!([])));
    settle_background(&counter, 1).await;
    assert_eq!(counter.count(), 1);
    assert_eq!(watch.entry().and_then(|e| e.value), Some(json!([])));

    cache.invalidate_key(&key);
    settle_background(&counter, 2).await;
    assert_eq!(counter.count(), 2);
    assert!(!cache.get(&key).unwrap().is_stale);

    drop(watch);
    cache.invalidate_key(&key);
    settle_background(&counter, 3).await;
    assert_eq!(counter.count(), 2);
    // Unwatched entries stay stale but keep serving their value.
    let entry = cache.get(&key).unwrap();
    assert!(entry.is_stale);
    assert_eq!(entry.value, Some(json!([])));
}

#[tokio::test]
async fn watch_skips_fetch_when_a_read_already_loaded_the_key() {
    let cache: QueryCache<Value> = QueryCache::default();
    let key = cache_key!["projectServices", fixtures::PROJECT_ID];
    let counter = CallCounter::new();

    let _watch = cache.watch(key.clone(), counting_fetcher(&counter, fixtures::project_services()));
    cache
        .ensure(key.clone(), counting_fetcher(&counter, fixtures::project_services()))
        .await
        .unwrap();
    settle_background(&counter, 2).await;
    assert_eq!(counter.count(), 1);
}

struct Rename {
    key: CacheKey,
    gate: Gate,
}

#[async_trait]
impl Mutation<Value> for Rename {
    type Output = ();

    fn affected_keys(&self) -> Vec<CacheKey> {
        vec![self.key.clone()]
    }

    fn apply(&self, _key: &CacheKey, _current: Option<&Value>) -> Value {
        json!({ "id": 42, "name": "Renamed" })
    }

    async fn execute(&self) -> Result<(), MutationError> {
        self.gate.wait().await;
        Ok(())
    }
}

#[tokio::test]
async fn fetch_landing_during_mutation_keeps_speculative_value() {
    let cache: QueryCache<Value> = QueryCache::default();
    let key = cache_key!["service", 42];
    cache.set(key.clone(), |_| fixtures::service(42, "Ingest"));
    cache.invalidate_key(&key);
    let coordinator = MutationCoordinator::new(cache.clone());

    let fetch_gate = Gate::new();
    let counter = CallCounter::new();
    let reader = {
        let cache = cache.clone();
        let fetcher = gated_fetcher(&counter, &fetch_gate, fixtures::service(42, "Ingest"));
        let key = key.clone();
        tokio::spawn(async move { cache.ensure(key, fetcher).await })
    };
    settle_background(&counter, 1).await;

    let mutation_gate = Gate::new();
    let pending = coordinator.spawn(Rename {
        key: key.clone(),
        gate: mutation_gate.clone(),
    });

    fetch_gate.open();
    let read = reader.await.unwrap().unwrap();
    // Readers joined on the old request see what the cache shows.
    assert_eq!(read.into_value()["name"], "Renamed");
    let entry = cache.get(&key).unwrap();
    assert_eq!(entry.value.as_ref().unwrap()["name"], "Renamed");
    assert!(entry.is_stale);
    assert!(entry.is_speculative());

    mutation_gate.open();
    pending.join().await.unwrap();
    // No reconcile: the speculative value stays until the next read refetches.
    let entry = cache.get(&key).unwrap();
    assert_eq!(entry.value.as_ref().unwrap()["name"], "Renamed");
    assert!(entry.is_stale);
    assert!(!entry.is_speculative());
}

#[tokio::test]
async fn invalidation_is_deferred_while_writes_are_pending() {
    let cache: QueryCache<Value> = QueryCache::default();
    let key = cache_key!["service", 42];
    let counter = CallCounter::new();
    let _watch = cache.watch(key.clone(), counting_fetcher(&counter, fixtures::service(42, "Server")));
    settle_background(&counter, 1).await;

    let coordinator = MutationCoordinator::new(cache.clone());
    let gate = Gate::new();
    let pending = coordinator.spawn(Rename {
        key: key.clone(),
        gate: gate.clone(),
    });

    cache.invalidate_key(&key);
    settle_background(&counter, 2).await;
    assert_eq!(counter.count(), 1);
    assert_eq!(cache.value(&key).unwrap()["name"], "Renamed");

    gate.open();
    pending.join().await.unwrap();
    settle_background(&counter, 2).await;
    assert_eq!(counter.count(), 2);
    assert_eq!(cache.value(&key).unwrap()["name"], "Server");
}

#[tokio::test]
async fn ensure_reads_your_own_pending_write() {
    let cache: QueryCache<Value> = QueryCache::default();
    let key = cache_key!["service", 42];
    let coordinator = MutationCoordinator::new(cache.clone());
    let gate = Gate::new();
    let pending = coordinator.spawn(Rename {
        key: key.clone(),
        gate: gate.clone(),
    });

    let counter = CallCounter::new();
    let read = cache
        .ensure(key.clone(), counting_fetcher(&counter, json!(null)))
        .await
        .unwrap();
    assert_eq!(counter.count(), 0);
    assert_eq!(read.value()["name"], "Renamed");

    gate.open();
    pending.join().await.unwrap();
}
