//! The view-facing shape of one cached query result.

use vantage_core::{CacheKey, FetchError, Timestamp};

use super::events::Revision;

/// Lifecycle of the most recent fetch for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
    /// Created but never fetched (e.g. only written by `set`).
    #[default]
    Idle,
    /// A fetch is in flight. Any previous value is still served.
    Loading,
    Success,
    /// The last fetch failed. The last good value is kept.
    Error,
}

/// A point-in-time copy of one cache entry.
///
/// Entries are owned by the cache; views only ever see clones of them.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: CacheKey,
    /// What views should render: the speculative value while optimistic
    /// writes are pending, else the last fetched or set value.
    pub value: Option<V>,
    pub status: QueryStatus,
    /// When the last successful fetch stored a value.
    pub fetched_at: Option<Timestamp>,
    /// When the value last changed for any reason.
    pub updated_at: Option<Timestamp>,
    pub is_stale: bool,
    /// Error of the last failed fetch, cleared by the next success.
    pub error: Option<FetchError>,
    /// Cache revision of the last write that touched this entry.
    pub revision: Revision,
    /// Optimistic writes applied to this entry and not yet settled.
    pub pending_writes: usize,
}

impl<V> CacheEntry<V> {
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    /// True while at least one optimistic write on this entry is in flight.
    pub fn is_speculative(&self) -> bool {
        self.pending_writes > 0
    }
}
