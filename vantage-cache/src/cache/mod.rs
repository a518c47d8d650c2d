//! Keyed query cache with explicit staleness.
//!
//! Every view reads remote data through one [`QueryCache`], addressed by
//! [`CacheKey`](vantage_core::CacheKey). A stale entry keeps serving its
//! last value while a refetch runs in the background, and a failed refetch
//! never erases the last good value.
//!
//! # Example
//!
//! ```ignore
//! let cache: QueryCache<serde_json::Value> = QueryCache::default();
//! let key = cache_key!["projectReviews", 7];
//!
//! // Concurrent callers share a single request.
//! let read = cache.ensure(key.clone(), move || api.get_json(path.clone())).await?;
//!
//! // After a write elsewhere, mark the whole collection stale.
//! cache.invalidate_prefix(&cache_key!["projectReviews"]);
//! ```

pub mod entry;
pub mod events;
pub mod freshness;
pub mod store;
pub mod traits;

pub use entry::{CacheEntry, QueryStatus};
pub use events::{CacheEvent, EventCause, KeyFilter, Revision, SubscriptionId};
pub use freshness::{CacheRead, Freshness};
pub use store::{CacheConfig, FetchRetry, QueryCache, QueryWatch};
pub use traits::{CacheStats, CacheValue, FetchFuture, QueryFetcher};
