//! Freshness contracts for cache reads.
//!
//! Callers state how much staleness they tolerate, and reads return a
//! [`CacheRead<V>`] that says where the value came from.

use chrono::Utc;
use std::time::Duration;
use vantage_core::Timestamp;

/// Staleness tolerance for `ensure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Freshness {
    /// A stored value stays fresh until something invalidates it.
    #[default]
    UntilInvalidated,

    /// A stored value is also stale once it is older than `max_age`.
    MaxAge {
        /// Maximum acceptable age of the stored value.
        max_age: Duration,
    },
}

impl Freshness {
    pub fn max_age(max_age: Duration) -> Self {
        Self::MaxAge { max_age }
    }

    /// Whether a value stored at `stored_at` is still acceptable at `now`.
    ///
    /// A value without a timestamp is only acceptable under
    /// `UntilInvalidated`.
    pub fn accepts(&self, stored_at: Option<Timestamp>, now: Timestamp) -> bool {
        match self {
            Freshness::UntilInvalidated => true,
            Freshness::MaxAge { max_age } => match stored_at {
                Some(stored_at) => age_between(stored_at, now) <= *max_age,
                None => false,
            },
        }
    }
}

fn age_between(earlier: Timestamp, later: Timestamp) -> Duration {
    later
        .signed_duration_since(earlier)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Result of `ensure`, carrying where the value came from.
#[derive(Debug, Clone)]
pub struct CacheRead<V> {
    value: V,
    stored_at: Option<Timestamp>,
    was_cache_hit: bool,
}

impl<V> CacheRead<V> {
    /// A value served from the cache without fetching.
    pub fn from_cache(value: V, stored_at: Option<Timestamp>) -> Self {
        Self {
            value,
            stored_at,
            was_cache_hit: true,
        }
    }

    /// A value produced by a fetch (possibly one shared with other readers).
    pub fn from_fetch(value: V) -> Self {
        Self {
            value,
            stored_at: Some(Utc::now()),
            was_cache_hit: false,
        }
    }

    pub fn into_value(self) -> V {
        self.value
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn stored_at(&self) -> Option<Timestamp> {
        self.stored_at
    }

    pub fn was_cache_hit(&self) -> bool {
        self.was_cache_hit
    }

    pub fn was_cache_miss(&self) -> bool {
        !self.was_cache_hit
    }

    /// Time since the value was stored, zero when unknown.
    pub fn staleness(&self) -> Duration {
        self.stored_at
            .map(|stored_at| age_between(stored_at, Utc::now()))
            .unwrap_or(Duration::ZERO)
    }

    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(V) -> U,
    {
        CacheRead {
            value: f(self.value),
            stored_at: self.stored_at,
            was_cache_hit: self.was_cache_hit,
        }
    }
}

impl<V> AsRef<V> for CacheRead<V> {
    fn as_ref(&self) -> &V {
        &self.value
    }
}
