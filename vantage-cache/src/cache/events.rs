//! Write revisions and the observer registry.
//!
//! Every write batch bumps the cache [`Revision`] and produces exactly one
//! [`CacheEvent`]. Observers are plain callbacks, invoked synchronously
//! after the batch is complete and after the cache lock is released, so a
//! callback may read the cache but never sees half of a batch.

use std::fmt;
use std::sync::Arc;
use vantage_core::{CacheKey, MutationId};

/// Monotonically increasing write counter of one cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Revision(pub u64);

impl Revision {
    pub fn zero() -> Self {
        Self(0)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn is_newer_than(&self, other: &Revision) -> bool {
        self.0 > other.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Why a batch of entries changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCause {
    FetchStarted,
    Fetched,
    FetchFailed,
    Set,
    Invalidated,
    /// An optimistic write was applied.
    Speculative,
    /// An optimistic write succeeded and was folded into the entries.
    Reconciled,
    /// An optimistic write failed and its delta was unwound.
    RolledBack,
}

/// One write batch.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub revision: Revision,
    pub cause: EventCause,
    pub keys: Vec<CacheKey>,
    pub mutation: Option<MutationId>,
}

impl CacheEvent {
    pub fn touches(&self, key: &CacheKey) -> bool {
        self.keys.iter().any(|k| k == key)
    }
}

/// Which events an observer wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFilter {
    All,
    Exact(CacheKey),
    Prefix(CacheKey),
}

impl KeyFilter {
    pub fn matches(&self, key: &CacheKey) -> bool {
        match self {
            KeyFilter::All => true,
            KeyFilter::Exact(exact) => exact == key,
            KeyFilter::Prefix(prefix) => key.starts_with(prefix),
        }
    }

    pub fn matches_event(&self, event: &CacheEvent) -> bool {
        event.keys.iter().any(|key| self.matches(key))
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

pub(crate) type Listener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Listeners {
    next_id: u64,
    entries: Vec<(SubscriptionId, KeyFilter, Listener)>,
}

impl Listeners {
    pub(crate) fn add(&mut self, filter: KeyFilter, listener: Listener) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.entries.push((id, filter, listener));
        id
    }

    pub(crate) fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(existing, _, _)| *existing != id);
        self.entries.len() != before
    }

    /// Listeners interested in `event`, cloned so they can run unlocked.
    pub(crate) fn interested(&self, event: &CacheEvent) -> Vec<Listener> {
        self.entries
            .iter()
            .filter(|(_, filter, _)| filter.matches_event(event))
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vantage_core::cache_key;

    #[test]
    fn test_revision_ordering() {
        let r0 = Revision::zero();
        let r1 = r0.next();
        assert!(r1.is_newer_than(&r0));
        assert!(!r0.is_newer_than(&r1));
        assert_eq!(r1.to_string(), "r1");
    }

    #[test]
    fn test_key_filter_matching() {
        let key = cache_key!["projectServices", 7];
        assert!(KeyFilter::All.matches(&key));
        assert!(KeyFilter::Exact(key.clone()).matches(&key));
        assert!(!KeyFilter::Exact(cache_key!["projectServices", 8]).matches(&key));
        assert!(KeyFilter::Prefix(cache_key!["projectServices"]).matches(&key));
    }

    #[test]
    fn test_listeners_filter_and_remove() {
        let mut listeners = Listeners::default();
        let services = listeners.add(
            KeyFilter::Prefix(cache_key!["projectServices"]),
            Arc::new(|_: &CacheEvent| {}),
        );
        listeners.add(KeyFilter::Exact(cache_key!["service", 1]), Arc::new(|_: &CacheEvent| {}));

        let event = CacheEvent {
            revision: Revision(1),
            cause: EventCause::Set,
            keys: vec![cache_key!["projectServices", 7]],
            mutation: None,
        };
        assert_eq!(listeners.interested(&event).len(), 1);
        assert!(listeners.remove(services));
        assert!(!listeners.remove(services));
        assert!(listeners.interested(&event).is_empty());
    }
}
