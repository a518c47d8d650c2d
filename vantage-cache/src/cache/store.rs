//! Keyed query cache with stale-while-revalidate reads.
//!
//! One [`QueryCache`] holds the last known value of every addressable query.
//! Reads go through [`QueryCache::ensure`], which deduplicates concurrent
//! fetches of the same key. Writes are synchronous and land as one batch
//! each, followed by one [`CacheEvent`] to observers.
//!
//! Optimistic writes are stacked per entry as *layers*. Each layer remembers
//! the value below it, so a failed write can be unwound without touching
//! writes issued after it. The mutation coordinator drives the layers
//! through the crate-private `begin_optimistic` / `commit_optimistic` /
//! `rollback_optimistic` hooks.

use chrono::Utc;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use vantage_core::{CacheKey, FetchError, FetchErrorKind, MutationId, Timestamp};

use super::entry::{CacheEntry, QueryStatus};
use super::events::{CacheEvent, EventCause, KeyFilter, Listeners, Revision, SubscriptionId};
use super::freshness::{CacheRead, Freshness};
use super::traits::{CacheStats, CacheValue, QueryFetcher};

/// Read-side retry policy for failed fetches.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRetry {
    /// Extra attempts after the first failure.
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl FetchRetry {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            attempts: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let cap = self.max_delay.max(self.initial_delay);
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        // Overflow and NaN fail the conversion; both mean "past the cap".
        Duration::try_from_secs_f64(secs).map_or(cap, |delay| delay.min(cap))
    }
}

impl Default for FetchRetry {
    fn default() -> Self {
        Self::none()
    }
}

/// Configuration for the query cache.
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// Freshness used by `ensure` and background refetch decisions.
    pub default_freshness: Freshness,
    pub retry: FetchRetry,
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat values older than `max_age` as stale.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.default_freshness = Freshness::max_age(max_age);
        self
    }

    pub fn with_retry(mut self, retry: FetchRetry) -> Self {
        self.retry = retry;
        self
    }
}

pub(crate) type ApplyFn<V> = Arc<dyn Fn(&CacheKey, Option<&V>) -> V + Send + Sync>;
type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, FetchError>>>;

/// An optimistic write on one entry.
struct Layer<V> {
    mutation: MutationId,
    /// Value underneath this layer: the rollback target.
    below: Option<V>,
    apply: ApplyFn<V>,
    /// Confirmed by the server but still above unsettled writes. Its
    /// result must survive a rollback of anything below it.
    settled: bool,
}

struct Slot<V> {
    value: Option<V>,
    status: QueryStatus,
    fetched_at: Option<Timestamp>,
    updated_at: Option<Timestamp>,
    error: Option<FetchError>,
    stale: bool,
    revision: Revision,
    layers: Vec<Layer<V>>,
    /// Refetch once the last layer settles.
    refetch_when_settled: bool,
    /// Bumped by every write; a fetch only lands if it is unchanged.
    write_epoch: u64,
    in_flight: Option<SharedFetch<V>>,
    fetcher: Option<Arc<dyn QueryFetcher<V>>>,
    watchers: usize,
}

impl<V: CacheValue> Slot<V> {
    fn new() -> Self {
        Self {
            value: None,
            status: QueryStatus::Idle,
            fetched_at: None,
            updated_at: None,
            error: None,
            stale: false,
            revision: Revision::zero(),
            layers: Vec::new(),
            refetch_when_settled: false,
            write_epoch: 0,
            in_flight: None,
            fetcher: None,
            watchers: 0,
        }
    }

    fn snapshot(&self, key: &CacheKey) -> CacheEntry<V> {
        CacheEntry {
            key: key.clone(),
            value: self.value.clone(),
            status: self.status,
            fetched_at: self.fetched_at,
            updated_at: self.updated_at,
            is_stale: self.stale,
            error: self.error.clone(),
            revision: self.revision,
            pending_writes: self.unsettled(),
        }
    }

    fn is_fresh(&self, freshness: Freshness, now: Timestamp) -> bool {
        self.value.is_some()
            && !self.stale
            && self.status != QueryStatus::Error
            && freshness.accepts(self.fetched_at.or(self.updated_at), now)
    }

    fn touch(&mut self, revision: Revision, now: Timestamp) {
        self.revision = revision;
        self.updated_at = Some(now);
        self.write_epoch += 1;
    }

    /// Re-apply every layer from `start` upwards on top of `layers[start].below`.
    fn rebase_from(&mut self, key: &CacheKey, start: usize) {
        let mut current = match self.layers.get(start) {
            Some(layer) => layer.below.clone(),
            None => return,
        };
        for layer in self.layers.iter_mut().skip(start) {
            layer.below = current.clone();
            current = Some((layer.apply)(key, current.as_ref()));
        }
        self.value = current;
    }

    fn layer_index(&self, mutation: MutationId) -> Option<usize> {
        self.layers
            .iter()
            .position(|layer| layer.mutation == mutation && !layer.settled)
    }

    fn unsettled(&self) -> usize {
        self.layers.iter().filter(|layer| !layer.settled).count()
    }

    /// Drop settled layers that no longer sit above a pending write.
    fn collapse_settled(&mut self) {
        while self.layers.first().map_or(false, |layer| layer.settled) {
            self.layers.remove(0);
        }
    }

    /// Once the stack is empty, honour a deferred refetch.
    fn settle_refetch(&mut self) -> bool {
        if !self.layers.is_empty() || !self.refetch_when_settled {
            return false;
        }
        self.refetch_when_settled = false;
        self.stale = true;
        self.wants_background_fetch()
    }

    fn wants_background_fetch(&self) -> bool {
        self.watchers > 0 && self.fetcher.is_some() && self.in_flight.is_none()
    }
}

struct State<V> {
    slots: HashMap<CacheKey, Slot<V>>,
    revision: Revision,
    stats: CacheStats,
}

impl<V> State<V> {
    fn bump(&mut self) -> Revision {
        self.revision = self.revision.next();
        self.revision
    }
}

struct Inner<V> {
    state: Mutex<State<V>>,
    listeners: Mutex<Listeners>,
    config: CacheConfig,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Single source of truth for query results.
///
/// Cloning is cheap and every clone addresses the same cache.
pub struct QueryCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for QueryCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: CacheValue> Default for QueryCache<V> {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl<V: CacheValue> QueryCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    slots: HashMap::new(),
                    revision: Revision::zero(),
                    stats: CacheStats::default(),
                }),
                listeners: Mutex::new(Listeners::default()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Current cache revision.
    pub fn revision(&self) -> Revision {
        lock(&self.inner.state).revision
    }

    pub fn stats(&self) -> CacheStats {
        let state = lock(&self.inner.state);
        let mut stats = state.stats.clone();
        stats.entry_count = state.slots.len() as u64;
        stats
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Pure lookup. Never creates an entry and never fetches.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        lock(&self.inner.state)
            .slots
            .get(key)
            .map(|slot| slot.snapshot(key))
    }

    /// Shorthand for the current value of `key`.
    pub fn value(&self, key: &CacheKey) -> Option<V> {
        lock(&self.inner.state)
            .slots
            .get(key)
            .and_then(|slot| slot.value.clone())
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = lock(&self.inner.state).slots.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Optimistic writes on `key` that have not settled yet.
    pub fn pending_writes(&self, key: &CacheKey) -> usize {
        lock(&self.inner.state)
            .slots
            .get(key)
            .map(|slot| slot.unsettled())
            .unwrap_or(0)
    }

    /// Return the cached value if fresh, else fetch it.
    ///
    /// Concurrent calls for the same key share one in-flight fetch. While
    /// optimistic writes are pending on the key the speculative value is
    /// returned without fetching.
    pub async fn ensure<F>(&self, key: CacheKey, fetcher: F) -> Result<CacheRead<V>, FetchError>
    where
        F: QueryFetcher<V>,
    {
        let freshness = self.inner.config.default_freshness;
        self.ensure_with(key, freshness, fetcher).await
    }

    /// [`ensure`](Self::ensure) with an explicit staleness tolerance.
    pub async fn ensure_with<F>(
        &self,
        key: CacheKey,
        freshness: Freshness,
        fetcher: F,
    ) -> Result<CacheRead<V>, FetchError>
    where
        F: QueryFetcher<V>,
    {
        let fetcher: Arc<dyn QueryFetcher<V>> = Arc::new(fetcher);
        self.ensure_shared(key, freshness, Some(fetcher), false).await
    }

    /// Fetch `key` again with its registered fetcher, ignoring freshness.
    ///
    /// Returns `None` if no fetcher was ever registered for the key.
    pub async fn refetch(&self, key: &CacheKey) -> Option<Result<CacheRead<V>, FetchError>> {
        let has_fetcher = lock(&self.inner.state)
            .slots
            .get(key)
            .map(|slot| slot.fetcher.is_some())
            .unwrap_or(false);
        if !has_fetcher {
            return None;
        }
        Some(
            self.ensure_shared(key.clone(), Freshness::UntilInvalidated, None, true)
                .await,
        )
    }

    async fn ensure_shared(
        &self,
        key: CacheKey,
        freshness: Freshness,
        fetcher: Option<Arc<dyn QueryFetcher<V>>>,
        force: bool,
    ) -> Result<CacheRead<V>, FetchError> {
        let (shared, started) = {
            let mut guard = lock(&self.inner.state);
            let state = &mut *guard;
            let now = Utc::now();
            let slot = state.slots.entry(key.clone()).or_insert_with(Slot::new);
            if let Some(fetcher) = fetcher {
                slot.fetcher = Some(fetcher);
            }

            if !slot.layers.is_empty() {
                if let Some(value) = slot.value.clone() {
                    state.stats.hits += 1;
                    return Ok(CacheRead::from_cache(value, slot.updated_at));
                }
            }

            if !force && slot.is_fresh(freshness, now) {
                if let Some(value) = slot.value.clone() {
                    state.stats.hits += 1;
                    tracing::trace!(key = %key, "cache hit");
                    return Ok(CacheRead::from_cache(value, slot.fetched_at.or(slot.updated_at)));
                }
            }

            if let Some(in_flight) = slot.in_flight.clone() {
                state.stats.joined += 1;
                tracing::trace!(key = %key, "joined in-flight fetch");
                (in_flight, None)
            } else {
                let Some(fetcher) = slot.fetcher.clone() else {
                    return Err(FetchError::cancelled(format!("no fetcher registered for {}", key)));
                };
                state.stats.misses += 1;
                let shared = self.start_fetch(slot, &key, fetcher);
                let revision = state.bump();
                if let Some(slot) = state.slots.get_mut(&key) {
                    slot.revision = revision;
                }
                let event = CacheEvent {
                    revision,
                    cause: EventCause::FetchStarted,
                    keys: vec![key.clone()],
                    mutation: None,
                };
                (shared, Some(event))
            }
        };

        if let Some(event) = started {
            self.notify(event);
        }
        shared.await.map(CacheRead::from_fetch)
    }

    /// Register the fetch future for `key`. Caller holds the state lock.
    fn start_fetch(
        &self,
        slot: &mut Slot<V>,
        key: &CacheKey,
        fetcher: Arc<dyn QueryFetcher<V>>,
    ) -> SharedFetch<V> {
        tracing::debug!(key = %key, "fetch started");
        slot.status = QueryStatus::Loading;
        let epoch = slot.write_epoch;
        let weak: Weak<Inner<V>> = Arc::downgrade(&self.inner);
        let retry = self.inner.config.retry.clone();
        let key = key.clone();

        let future = async move {
            let result = fetch_with_retry(&weak, fetcher, &key, &retry).await;
            match weak.upgrade() {
                Some(inner) => QueryCache { inner }.finish_fetch(&key, epoch, result),
                None => result,
            }
        };
        let shared = future.boxed().shared();
        slot.in_flight = Some(shared.clone());
        shared
    }

    /// Fold a completed fetch into its slot and return what readers get.
    fn finish_fetch(
        &self,
        key: &CacheKey,
        epoch: u64,
        result: Result<V, FetchError>,
    ) -> Result<V, FetchError> {
        let mut refetch = false;
        let (event, outcome) = {
            let mut guard = lock(&self.inner.state);
            let state = &mut *guard;
            let revision = state.bump();
            let now = Utc::now();
            let Some(slot) = state.slots.get_mut(key) else {
                return result;
            };
            slot.in_flight = None;
            slot.revision = revision;

            match result {
                Ok(fetched) => {
                    slot.status = QueryStatus::Success;
                    slot.error = None;
                    let outcome = if slot.write_epoch == epoch {
                        tracing::debug!(key = %key, "fetch stored");
                        slot.value = Some(fetched.clone());
                        slot.fetched_at = Some(now);
                        slot.updated_at = Some(now);
                        slot.stale = false;
                        fetched
                    } else {
                        // A write touched the key while the request was out;
                        // the response may predate it.
                        tracing::debug!(key = %key, "fetch superseded by a newer write");
                        if slot.value.is_none() && slot.layers.is_empty() {
                            slot.value = Some(fetched.clone());
                            slot.fetched_at = Some(now);
                            slot.updated_at = Some(now);
                        }
                        slot.stale = true;
                        if slot.layers.is_empty() {
                            refetch = slot.wants_background_fetch();
                        } else {
                            slot.refetch_when_settled = true;
                        }
                        slot.value.clone().unwrap_or(fetched)
                    };
                    let event = CacheEvent {
                        revision,
                        cause: EventCause::Fetched,
                        keys: vec![key.clone()],
                        mutation: None,
                    };
                    (event, Ok(outcome))
                }
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "fetch failed, keeping last value");
                    state.stats.failures += 1;
                    slot.status = QueryStatus::Error;
                    slot.error = Some(err.clone());
                    let event = CacheEvent {
                        revision,
                        cause: EventCause::FetchFailed,
                        keys: vec![key.clone()],
                        mutation: None,
                    };
                    (event, Err(err))
                }
            }
        };

        self.notify(event);
        if refetch {
            self.schedule_refetch(vec![key.clone()]);
        }
        outcome
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Replace the value of `key` with `updater(old)`, synchronously.
    ///
    /// Creates the entry if needed. On an entry with pending optimistic
    /// writes only the displayed value changes; the writes' rollback targets
    /// are left alone.
    pub fn set<F>(&self, key: CacheKey, updater: F)
    where
        F: FnOnce(Option<&V>) -> V,
    {
        let event = {
            let mut guard = lock(&self.inner.state);
            let state = &mut *guard;
            let revision = state.bump();
            let slot = state.slots.entry(key.clone()).or_insert_with(Slot::new);
            let next = updater(slot.value.as_ref());
            slot.value = Some(next);
            if slot.status == QueryStatus::Idle {
                slot.status = QueryStatus::Success;
            }
            slot.touch(revision, Utc::now());
            CacheEvent {
                revision,
                cause: EventCause::Set,
                keys: vec![key],
                mutation: None,
            }
        };
        self.notify(event);
    }

    /// Mark every entry whose key satisfies `predicate` as stale.
    ///
    /// Values are kept (stale-while-revalidate). Watched entries are
    /// refetched in the background; entries with pending optimistic writes
    /// are refetched once those writes settle. Returns the number of
    /// entries marked.
    pub fn invalidate<P>(&self, predicate: P) -> usize
    where
        P: Fn(&CacheKey) -> bool,
    {
        let mut refetch = Vec::new();
        let event = {
            let mut guard = lock(&self.inner.state);
            let state = &mut *guard;
            let matching: Vec<CacheKey> = state
                .slots
                .keys()
                .filter(|key| predicate(key))
                .cloned()
                .collect();
            if matching.is_empty() {
                return 0;
            }
            let revision = state.bump();
            for key in &matching {
                let Some(slot) = state.slots.get_mut(key) else {
                    continue;
                };
                slot.stale = true;
                slot.revision = revision;
                slot.write_epoch += 1;
                if !slot.layers.is_empty() {
                    slot.refetch_when_settled = true;
                } else if slot.wants_background_fetch() {
                    refetch.push(key.clone());
                }
            }
            tracing::debug!(count = matching.len(), "entries invalidated");
            CacheEvent {
                revision,
                cause: EventCause::Invalidated,
                keys: matching,
                mutation: None,
            }
        };
        let count = event.keys.len();
        self.notify(event);
        self.schedule_refetch(refetch);
        count
    }

    /// Invalidate every key starting with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &CacheKey) -> usize {
        self.invalidate(|key| key.starts_with(prefix))
    }

    pub fn invalidate_key(&self, key: &CacheKey) -> usize {
        self.invalidate(|candidate| candidate == key)
    }

    // ========================================================================
    // SUBSCRIPTIONS
    // ========================================================================

    /// Call `listener` after every write batch touching a key that matches
    /// `filter`.
    pub fn subscribe<L>(&self, filter: KeyFilter, listener: L) -> SubscriptionId
    where
        L: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        lock(&self.inner.listeners).add(filter, Arc::new(listener))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        lock(&self.inner.listeners).remove(id)
    }

    /// Register `key` as rendered by a view.
    ///
    /// Remembers the fetcher, starts a background `ensure` if the entry is
    /// not fresh, and keeps the key eligible for background refetches until
    /// the returned guard is dropped.
    pub fn watch<F>(&self, key: CacheKey, fetcher: F) -> QueryWatch<V>
    where
        F: QueryFetcher<V>,
    {
        let needs_fetch = {
            let mut guard = lock(&self.inner.state);
            let slot = guard.slots.entry(key.clone()).or_insert_with(Slot::new);
            slot.fetcher = Some(Arc::new(fetcher));
            slot.watchers += 1;
            slot.layers.is_empty()
                && slot.in_flight.is_none()
                && !slot.is_fresh(self.inner.config.default_freshness, Utc::now())
        };
        if needs_fetch {
            self.schedule_refetch(vec![key.clone()]);
        }
        QueryWatch {
            cache: self.clone(),
            key,
        }
    }

    fn unwatch(&self, key: &CacheKey) {
        if let Some(slot) = lock(&self.inner.state).slots.get_mut(key) {
            slot.watchers = slot.watchers.saturating_sub(1);
        }
    }

    fn notify(&self, event: CacheEvent) {
        let listeners = lock(&self.inner.listeners).interested(&event);
        for listener in listeners {
            listener(&event);
        }
    }

    /// Spawn background refetches on the current tokio runtime, if any.
    fn schedule_refetch(&self, keys: Vec<CacheKey>) {
        if keys.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(count = keys.len(), "no runtime, refetch deferred to next read");
            return;
        };
        for key in keys {
            let cache = self.clone();
            handle.spawn(async move {
                // Skipped if a read already made the entry fresh.
                let freshness = cache.inner.config.default_freshness;
                if let Err(err) = cache.ensure_shared(key.clone(), freshness, None, false).await {
                    tracing::debug!(key = %key, error = %err, "background refetch failed");
                }
            });
        }
    }

    // ========================================================================
    // OPTIMISTIC LAYERS (driven by the mutation coordinator)
    // ========================================================================

    /// Snapshot and speculatively apply one write to every key, atomically.
    ///
    /// Returns the value each key held just before the write.
    pub(crate) fn begin_optimistic(
        &self,
        mutation: MutationId,
        keys: &[CacheKey],
        apply: ApplyFn<V>,
    ) -> Vec<(CacheKey, Option<V>)> {
        if keys.is_empty() {
            return Vec::new();
        }
        let (event, prior) = {
            let mut guard = lock(&self.inner.state);
            let state = &mut *guard;
            let revision = state.bump();
            let now = Utc::now();
            let mut prior = Vec::with_capacity(keys.len());
            for key in keys {
                let slot = state.slots.entry(key.clone()).or_insert_with(Slot::new);
                let below = slot.value.clone();
                let next = apply(key, below.as_ref());
                slot.layers.push(Layer {
                    mutation,
                    below: below.clone(),
                    apply: Arc::clone(&apply),
                    settled: false,
                });
                slot.value = Some(next);
                slot.touch(revision, now);
                prior.push((key.clone(), below));
            }
            let event = CacheEvent {
                revision,
                cause: EventCause::Speculative,
                keys: keys.to_vec(),
                mutation: Some(mutation),
            };
            (event, prior)
        };
        self.notify(event);
        prior
    }

    /// Settle a successful write.
    ///
    /// `reconcile(key, value)` folds the server result into the value the
    /// write produced; `None` means the key must be refetched instead. A
    /// write that has been superseded by a newer pending write never changes
    /// the displayed value; its confirmed result becomes the newer write's
    /// rollback target. A write that still sits above unsettled writes keeps
    /// its confirmed result in the stack so their rollback cannot undo it.
    pub(crate) fn commit_optimistic(
        &self,
        mutation: MutationId,
        keys: &[CacheKey],
        reconcile: &dyn Fn(&CacheKey, Option<&V>) -> Option<V>,
    ) {
        if keys.is_empty() {
            return;
        }
        let mut refetch = Vec::new();
        let event = {
            let mut guard = lock(&self.inner.state);
            let state = &mut *guard;
            let revision = state.bump();
            let now = Utc::now();
            for key in keys {
                let Some(slot) = state.slots.get_mut(key) else {
                    continue;
                };
                let Some(index) = slot.layer_index(mutation) else {
                    continue;
                };
                let is_top = index + 1 == slot.layers.len();
                if index == 0 {
                    slot.layers.remove(0);
                    if is_top {
                        match reconcile(key, slot.value.as_ref()) {
                            Some(confirmed) => slot.value = Some(confirmed),
                            None => slot.refetch_when_settled = true,
                        }
                    } else {
                        // layers[0] is now the write directly above; its
                        // `below` is exactly what this write produced.
                        let above = &mut slot.layers[0];
                        match reconcile(key, above.below.as_ref()) {
                            Some(confirmed) => above.below = Some(confirmed),
                            None => slot.refetch_when_settled = true,
                        }
                        slot.collapse_settled();
                    }
                } else {
                    let produced = if is_top {
                        slot.value.clone()
                    } else {
                        slot.layers[index + 1].below.clone()
                    };
                    match reconcile(key, produced.as_ref()) {
                        Some(confirmed) => {
                            let fixed = confirmed.clone();
                            slot.layers[index].apply =
                                Arc::new(move |_: &CacheKey, _: Option<&V>| fixed.clone());
                            if is_top {
                                slot.value = Some(confirmed);
                            } else {
                                slot.layers[index + 1].below = Some(confirmed);
                            }
                        }
                        None => slot.refetch_when_settled = true,
                    }
                    slot.layers[index].settled = true;
                }
                slot.touch(revision, now);
                if slot.settle_refetch() {
                    refetch.push(key.clone());
                }
            }
            CacheEvent {
                revision,
                cause: EventCause::Reconciled,
                keys: keys.to_vec(),
                mutation: Some(mutation),
            }
        };
        self.notify(event);
        self.schedule_refetch(refetch);
    }

    /// Unwind a failed write.
    ///
    /// On top of the stack the entry is restored exactly to the value below
    /// the write. Underneath newer writes, the layer is spliced out and the
    /// newer writes (settled ones included) are re-applied on the value
    /// below it.
    pub(crate) fn rollback_optimistic(&self, mutation: MutationId, keys: &[CacheKey]) {
        if keys.is_empty() {
            return;
        }
        let mut refetch = Vec::new();
        let event = {
            let mut guard = lock(&self.inner.state);
            let state = &mut *guard;
            let revision = state.bump();
            let now = Utc::now();
            for key in keys {
                let Some(slot) = state.slots.get_mut(key) else {
                    continue;
                };
                let Some(index) = slot.layer_index(mutation) else {
                    continue;
                };
                let layer = slot.layers.remove(index);
                if index == slot.layers.len() {
                    slot.value = layer.below;
                } else {
                    slot.layers[index].below = layer.below;
                    slot.rebase_from(key, index);
                    slot.collapse_settled();
                }
                slot.touch(revision, now);
                if slot.settle_refetch() {
                    refetch.push(key.clone());
                }
            }
            CacheEvent {
                revision,
                cause: EventCause::RolledBack,
                keys: keys.to_vec(),
                mutation: Some(mutation),
            }
        };
        self.notify(event);
        self.schedule_refetch(refetch);
    }
}

/// Call the fetcher, retrying transient failures per the cache's policy.
async fn fetch_with_retry<V: CacheValue>(
    inner: &Weak<Inner<V>>,
    fetcher: Arc<dyn QueryFetcher<V>>,
    key: &CacheKey,
    retry: &FetchRetry,
) -> Result<V, FetchError> {
    let mut attempt = 0;
    loop {
        if let Some(inner) = inner.upgrade() {
            lock(&inner.state).stats.fetches += 1;
        }
        match fetcher.fetch(key).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < retry.attempts && is_retryable(&err) => {
                let delay = retry.delay_for(attempt);
                tracing::debug!(key = %key, attempt, ?delay, error = %err, "retrying fetch");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn is_retryable(err: &FetchError) -> bool {
    match err.kind {
        FetchErrorKind::Network => true,
        FetchErrorKind::Server { status } => status >= 500,
        FetchErrorKind::Decode | FetchErrorKind::Cancelled => false,
    }
}

/// Guard for a key rendered by a view. Dropping it stops background
/// refetches driven by this watcher.
pub struct QueryWatch<V: CacheValue> {
    cache: QueryCache<V>,
    key: CacheKey,
}

impl<V: CacheValue> QueryWatch<V> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn entry(&self) -> Option<CacheEntry<V>> {
        self.cache.get(&self.key)
    }
}

impl<V: CacheValue> Drop for QueryWatch<V> {
    fn drop(&mut self) {
        self.cache.unwatch(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vantage_core::cache_key;

    fn counting_fetcher(
        calls: Arc<AtomicUsize>,
        value: i64,
    ) -> impl Fn() -> futures_util::future::Ready<Result<i64, FetchError>> + Send + Sync + 'static
    {
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            futures_util::future::ready(Ok(value))
        }
    }

    #[test]
    fn test_get_never_creates_entries() {
        let cache: QueryCache<i64> = QueryCache::default();
        assert!(cache.get(&cache_key!["missing"]).is_none());
        assert!(cache.keys().is_empty());
    }

    #[test]
    fn test_set_creates_and_updates() {
        let cache: QueryCache<i64> = QueryCache::default();
        let key = cache_key!["counter"];
        cache.set(key.clone(), |old| old.copied().unwrap_or(0) + 1);
        cache.set(key.clone(), |old| old.copied().unwrap_or(0) + 1);
        let entry = cache.get(&key).unwrap();
        assert_eq!(entry.value, Some(2));
        assert_eq!(entry.status, QueryStatus::Success);
        assert_eq!(entry.revision, Revision(2));
    }

    #[tokio::test]
    async fn test_ensure_fetches_once_then_hits() {
        let cache: QueryCache<i64> = QueryCache::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = cache_key!["answer"];

        let first = cache
            .ensure(key.clone(), counting_fetcher(calls.clone(), 42))
            .await
            .unwrap();
        assert!(first.was_cache_miss());
        let second = cache
            .ensure(key.clone(), counting_fetcher(calls.clone(), 42))
            .await
            .unwrap();
        assert!(second.was_cache_hit());
        assert_eq!(second.into_value(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let entry = cache.get(&key).unwrap();
        assert_eq!(entry.status, QueryStatus::Success);
        assert!(entry.fetched_at.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_marks_stale_and_keeps_value() {
        let cache: QueryCache<i64> = QueryCache::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = cache_key!["projectReviews", 7];
        cache
            .ensure(key.clone(), counting_fetcher(calls.clone(), 1))
            .await
            .unwrap();

        assert_eq!(cache.invalidate_prefix(&cache_key!["projectReviews"]), 1);
        let entry = cache.get(&key).unwrap();
        assert!(entry.is_stale);
        assert_eq!(entry.value, Some(1));

        let read = cache
            .ensure(key.clone(), counting_fetcher(calls.clone(), 2))
            .await
            .unwrap();
        assert_eq!(read.into_value(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!cache.get(&key).unwrap().is_stale);
    }

    #[tokio::test]
    async fn test_fetch_error_keeps_last_good_value() {
        let cache: QueryCache<i64> = QueryCache::default();
        let key = cache_key!["services"];
        cache
            .ensure(key.clone(), || async { Ok::<_, FetchError>(5) })
            .await
            .unwrap();
        cache.invalidate_key(&key);

        let err = cache
            .ensure(key.clone(), || async {
                Err::<i64, _>(FetchError::server(503, "maintenance"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Server { status: 503 });

        let entry = cache.get(&key).unwrap();
        assert_eq!(entry.status, QueryStatus::Error);
        assert_eq!(entry.value, Some(5));
        assert_eq!(entry.error, Some(err));
        assert_eq!(cache.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_max_age_freshness_refetches_old_values() {
        let cache: QueryCache<i64> = QueryCache::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = cache_key!["bids"];
        cache
            .ensure(key.clone(), counting_fetcher(calls.clone(), 1))
            .await
            .unwrap();
        cache
            .ensure_with(
                key.clone(),
                Freshness::max_age(Duration::ZERO),
                counting_fetcher(calls.clone(), 1),
            )
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_recovers_transient_failure() {
        let config = CacheConfig::new().with_retry(FetchRetry {
            attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        });
        let cache: QueryCache<i64> = QueryCache::new(config);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let read = cache
            .ensure(cache_key!["flaky"], move || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(FetchError::network("connection reset"))
                    } else {
                        Ok(9)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(read.into_value(), 9);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().fetches, 2);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let config = CacheConfig::new().with_retry(FetchRetry {
            attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            multiplier: 1.0,
        });
        let cache: QueryCache<i64> = QueryCache::new(config);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = cache
            .ensure(cache_key!["forbidden"], move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<i64, _>(FetchError::server(404, "not found")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let retry = FetchRetry {
            attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            multiplier: 2.0,
        };
        assert_eq!(retry.delay_for(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for(2), Duration::from_millis(250));
    }

    #[test]
    fn test_retry_delay_saturates_at_large_attempts() {
        let retry = FetchRetry {
            attempts: 40,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 10.0,
        };
        assert_eq!(retry.delay_for(39), Duration::from_secs(1));
        assert_eq!(retry.delay_for(u32::MAX), Duration::from_secs(1));

        let unbounded = FetchRetry {
            multiplier: f64::INFINITY,
            ..retry
        };
        assert_eq!(unbounded.delay_for(0), Duration::from_millis(100));
        assert_eq!(unbounded.delay_for(1), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_refetch_without_fetcher_is_none() {
        let cache: QueryCache<i64> = QueryCache::default();
        cache.set(cache_key!["local"], |_| 1);
        assert!(cache.refetch(&cache_key!["local"]).await.is_none());
    }

    #[test]
    fn test_subscribers_see_complete_batches() {
        let cache: QueryCache<i64> = QueryCache::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reader = cache.clone();
        cache.subscribe(KeyFilter::All, move |event| {
            let value = event.keys.first().and_then(|key| reader.value(key));
            lock(&sink).push((event.cause, value));
        });

        cache.set(cache_key!["a"], |_| 3);
        cache.invalidate_key(&cache_key!["a"]);

        let seen = lock(&seen).clone();
        assert_eq!(
            seen,
            vec![(EventCause::Set, Some(3)), (EventCause::Invalidated, Some(3))]
        );
    }
}
