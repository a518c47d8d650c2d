//! Optimistic mutation coordinator.
//!
//! A mutation is shown before the server confirms it: its speculative value
//! is applied to every affected key in one batch, the network call runs,
//! and the outcome is folded back into the cache. On failure each affected
//! key is unwound exactly; on success the server's answer replaces the
//! speculation, or the key is refetched when it cannot be reconciled.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use vantage_core::{CacheKey, MutationError, MutationId};

use super::snapshot::MutationSnapshot;
use crate::cache::store::{lock, ApplyFn};
use crate::cache::{CacheValue, QueryCache};

/// Message shown when neither the mutation nor the server supplies one.
pub const DEFAULT_FAILURE_MESSAGE: &str = "Something went wrong. Please try again.";

/// A user-initiated write against the remote API.
#[async_trait]
pub trait Mutation<V: CacheValue>: Send + Sync + 'static {
    /// What the server answers on success.
    type Output: Send + 'static;

    /// Every cache entry the speculative change touches.
    fn affected_keys(&self) -> Vec<CacheKey>;

    /// Speculative value for `key`, given its current value. Must be pure:
    /// it is re-applied when an older write below it is rolled back.
    fn apply(&self, key: &CacheKey, current: Option<&V>) -> V;

    /// The network call. Never retried by the coordinator.
    async fn execute(&self) -> Result<Self::Output, MutationError>;

    /// Fold the server result into `key`. `None` invalidates the key so it
    /// refetches once nothing else is pending on it.
    fn reconcile(&self, _key: &CacheKey, _output: &Self::Output, _current: Option<&V>) -> Option<V> {
        None
    }

    /// User-facing text when the write fails without a server message.
    fn failure_message(&self) -> &str {
        DEFAULT_FAILURE_MESSAGE
    }
}

#[derive(Debug)]
struct PendingInfo {
    keys: Vec<CacheKey>,
}

type PendingRegistry = Arc<Mutex<HashMap<MutationId, PendingInfo>>>;

/// Runs mutations against one [`QueryCache`].
///
/// Snapshot and speculative apply happen synchronously when a mutation is
/// issued, so overlapping mutations stack in issue order regardless of
/// when their network calls complete.
pub struct MutationCoordinator<V> {
    cache: QueryCache<V>,
    next_id: Arc<AtomicU64>,
    pending: PendingRegistry,
}

impl<V> Clone for MutationCoordinator<V> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            next_id: Arc::clone(&self.next_id),
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<V: CacheValue> MutationCoordinator<V> {
    pub fn new(cache: QueryCache<V>) -> Self {
        Self {
            cache,
            next_id: Arc::new(AtomicU64::new(0)),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn cache(&self) -> &QueryCache<V> {
        &self.cache
    }

    /// Apply `mutation` optimistically, execute it, and settle the cache.
    pub async fn run<M>(&self, mutation: M) -> Result<M::Output, MutationError>
    where
        M: Mutation<V>,
    {
        let mutation = Arc::new(mutation);
        let snapshot = self.begin(&mutation);
        let guard = self.settle_guard(&snapshot);
        self.finish(mutation, guard).await
    }

    /// Apply `mutation` now and drive the rest on the tokio runtime.
    ///
    /// The speculative value is visible as soon as this returns. If the
    /// task is dropped before it settles, even unpolled at runtime
    /// shutdown, the write is unwound.
    pub fn spawn<M>(&self, mutation: M) -> PendingMutation<M::Output, V>
    where
        M: Mutation<V>,
    {
        let mutation = Arc::new(mutation);
        let snapshot = self.begin(&mutation);
        let guard = self.settle_guard(&snapshot);
        let coordinator = self.clone();
        let handle = tokio::spawn(async move { coordinator.finish(mutation, guard).await });
        PendingMutation {
            snapshot,
            pending: Arc::clone(&self.pending),
            handle,
        }
    }

    /// True while `id` has been applied and not yet settled.
    pub fn is_pending(&self, id: MutationId) -> bool {
        lock(&self.pending).contains_key(&id)
    }

    /// True while any unsettled mutation touches `key`.
    pub fn has_pending(&self, key: &CacheKey) -> bool {
        lock(&self.pending)
            .values()
            .any(|info| info.keys.iter().any(|k| k == key))
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Snapshot and speculatively apply, atomically across all keys.
    fn begin<M>(&self, mutation: &Arc<M>) -> MutationSnapshot<V>
    where
        M: Mutation<V>,
    {
        let id = MutationId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let keys = dedup_keys(mutation.affected_keys());
        lock(&self.pending).insert(id, PendingInfo { keys: keys.clone() });

        let apply_with = Arc::clone(mutation);
        let apply: ApplyFn<V> =
            Arc::new(move |key: &CacheKey, current: Option<&V>| apply_with.apply(key, current));
        let prior = self.cache.begin_optimistic(id, &keys, apply);
        tracing::debug!(mutation = %id, keys = keys.len(), "optimistic write applied");
        MutationSnapshot::new(id, prior)
    }

    fn settle_guard(&self, snapshot: &MutationSnapshot<V>) -> SettleGuard<V> {
        SettleGuard {
            cache: self.cache.clone(),
            pending: Arc::clone(&self.pending),
            id: snapshot.mutation_id(),
            keys: Some(snapshot.affected_keys().to_vec()),
        }
    }

    async fn finish<M>(
        &self,
        mutation: Arc<M>,
        mut guard: SettleGuard<V>,
    ) -> Result<M::Output, MutationError>
    where
        M: Mutation<V>,
    {
        let result = mutation.execute().await;
        let id = guard.id;
        let keys = guard.disarm();
        lock(&self.pending).remove(&id);

        match result {
            Ok(output) => {
                self.cache.commit_optimistic(id, &keys, &|key: &CacheKey, current: Option<&V>| {
                    mutation.reconcile(key, &output, current)
                });
                tracing::debug!(mutation = %id, "mutation confirmed");
                Ok(output)
            }
            Err(err) => {
                tracing::warn!(mutation = %id, error = %err, "mutation failed, rolling back");
                self.cache.rollback_optimistic(id, &keys);
                Err(err)
            }
        }
    }
}

/// Unwinds a mutation whose driving future was dropped before it settled,
/// whether mid-flight or never polled.
///
/// The request may still have reached the server, so the keys are also
/// invalidated.
struct SettleGuard<V: CacheValue> {
    cache: QueryCache<V>,
    pending: PendingRegistry,
    id: MutationId,
    keys: Option<Vec<CacheKey>>,
}

impl<V: CacheValue> SettleGuard<V> {
    /// Hand the keys back to the caller, which now settles them.
    fn disarm(&mut self) -> Vec<CacheKey> {
        self.keys.take().unwrap_or_default()
    }
}

impl<V: CacheValue> Drop for SettleGuard<V> {
    fn drop(&mut self) {
        let Some(keys) = self.keys.take() else {
            return;
        };
        tracing::warn!(mutation = %self.id, "mutation abandoned before settling");
        lock(&self.pending).remove(&self.id);
        self.cache.rollback_optimistic(self.id, &keys);
        self.cache.invalidate(|key| keys.contains(key));
    }
}

/// Handle to a mutation running in the background.
pub struct PendingMutation<O, V> {
    snapshot: MutationSnapshot<V>,
    pending: PendingRegistry,
    handle: JoinHandle<Result<O, MutationError>>,
}

impl<O, V> PendingMutation<O, V> {
    pub fn id(&self) -> MutationId {
        self.snapshot.mutation_id()
    }

    pub fn snapshot(&self) -> &MutationSnapshot<V> {
        &self.snapshot
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.pending).contains_key(&self.snapshot.mutation_id())
    }

    /// Wait for the mutation to settle.
    pub async fn join(self) -> Result<O, MutationError> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(MutationError::aborted(err.to_string())),
        }
    }
}

fn dedup_keys(keys: Vec<CacheKey>) -> Vec<CacheKey> {
    let mut seen = HashSet::new();
    keys.into_iter().filter(|key| seen.insert(key.clone())).collect()
}
