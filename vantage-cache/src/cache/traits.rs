//! Fetcher trait and cache statistics.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::future::Future;
use vantage_core::{CacheKey, FetchError};

/// Values the cache can hold.
///
/// Values are cloned out to readers and shared between deduplicated
/// fetches, so they must be cheap enough to clone and thread-safe.
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + 'static {}

/// Boxed future produced by a [`QueryFetcher`].
pub type FetchFuture<V> = BoxFuture<'static, Result<V, FetchError>>;

/// Loads the authoritative value for one key from the remote API.
///
/// Any `Fn() -> impl Future<Output = Result<V, FetchError>>` closure is a
/// fetcher. The cache may call a fetcher again for background refetches
/// and read-side retries, so it must be callable more than once.
pub trait QueryFetcher<V>: Send + Sync + 'static {
    fn fetch(&self, key: &CacheKey) -> FetchFuture<V>;
}

impl<V, F, Fut> QueryFetcher<V> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
{
    fn fetch(&self, _key: &CacheKey) -> FetchFuture<V> {
        (self)().boxed()
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// `ensure` calls answered from the cache.
    pub hits: u64,
    /// `ensure` calls that started a fetch.
    pub misses: u64,
    /// `ensure` calls that joined a fetch already in flight.
    pub joined: u64,
    /// Fetcher invocations, retries included.
    pub fetches: u64,
    /// Fetches that ended in an error after retries.
    pub failures: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0). Joined reads count as hits.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.joined + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits + self.joined) as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vantage_core::cache_key;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 70,
            joined: 10,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_closure_is_a_fetcher() {
        let fetcher = || async { Ok::<_, FetchError>(vec![1, 2, 3]) };
        let value = fetcher.fetch(&cache_key!["numbers"]).await.unwrap();
        assert_eq!(value, vec![1, 2, 3]);
    }
}
