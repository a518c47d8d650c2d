//! Vantage Cache - Keyed Query Cache and Optimistic Mutations
//!
//! The data layer behind every workspace view: one [`QueryCache`] holding
//! the last known value of each remote query, and a
//! [`MutationCoordinator`] that shows writes before the server confirms
//! them and converges the cache to server truth afterwards.

pub mod cache;
pub mod mutation;

pub use cache::{
    CacheConfig, CacheEntry, CacheEvent, CacheRead, CacheStats, CacheValue, EventCause,
    FetchFuture, FetchRetry, Freshness, KeyFilter, QueryCache, QueryFetcher, QueryStatus,
    QueryWatch, Revision, SubscriptionId,
};
pub use mutation::{
    Mutation, MutationCoordinator, MutationSnapshot, PendingMutation, DEFAULT_FAILURE_MESSAGE,
};

pub use vantage_core::{cache_key, CacheKey, FetchError, MutationError, MutationId};
