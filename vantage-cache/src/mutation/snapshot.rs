//! Pre-mutation values of the keys a write touches.

use std::collections::HashMap;
use vantage_core::{CacheKey, MutationId};

/// Values the affected keys held immediately before a mutation applied.
///
/// Taken in the same lock acquisition as the speculative apply, so no other
/// write can slip in between. Immutable once created.
#[derive(Debug, Clone)]
pub struct MutationSnapshot<V> {
    mutation: MutationId,
    affected_keys: Vec<CacheKey>,
    prior_values: HashMap<CacheKey, Option<V>>,
}

impl<V> MutationSnapshot<V> {
    pub(crate) fn new(mutation: MutationId, prior: Vec<(CacheKey, Option<V>)>) -> Self {
        let affected_keys = prior.iter().map(|(key, _)| key.clone()).collect();
        Self {
            mutation,
            affected_keys,
            prior_values: prior.into_iter().collect(),
        }
    }

    pub fn mutation_id(&self) -> MutationId {
        self.mutation
    }

    /// Affected keys in declaration order, without duplicates.
    pub fn affected_keys(&self) -> &[CacheKey] {
        &self.affected_keys
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.prior_values.contains_key(key)
    }

    /// Prior value of `key`; `None` if the key had no value or is not
    /// affected.
    pub fn prior_value(&self, key: &CacheKey) -> Option<&V> {
        self.prior_values.get(key).and_then(Option::as_ref)
    }
}
