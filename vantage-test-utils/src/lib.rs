//! Vantage Test Utilities
//!
//! Shared test infrastructure for the Vantage workspace:
//! - Proptest generators for keys, entity references and JSON entities
//! - Fixtures for the review and billing scenarios
//! - Synchronisation helpers for holding fetches and mutations in flight

pub use vantage_core::{
    cache_key, CacheKey, EntityId, EntityRef, FetchError, KeyPart, MutationError, MutationId,
};

use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

// ============================================================================
// SYNCHRONISATION HELPERS
// ============================================================================

/// A one-shot barrier: tasks `wait` until someone calls `open`.
///
/// Used to keep a fetch or a mutation's network call pending while the
/// test interleaves other operations.
#[derive(Clone, Default)]
pub struct Gate {
    inner: Arc<GateInner>,
}

#[derive(Default)]
struct GateInner {
    open: AtomicBool,
    notify: Notify,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.inner.open.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            // Registered before the check so an `open` in between is not lost.
            let notified = self.inner.notify.notified();
            if self.is_open() {
                return;
            }
            notified.await;
        }
    }
}

/// Counts invocations across clones.
#[derive(Clone, Default, Debug)]
pub struct CallCounter {
    calls: Arc<AtomicUsize>,
}

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call and return how many came before it.
    pub fn hit(&self) -> usize {
        self.calls.fetch_add(1, Ordering::SeqCst)
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Vantage value types.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_key_part() -> impl Strategy<Value = KeyPart> {
        prop_oneof![
            any::<bool>().prop_map(KeyPart::Bool),
            (-1000i64..1000).prop_map(KeyPart::Int),
            "[a-zA-Z]{1,12}".prop_map(KeyPart::Str),
        ]
    }

    /// A key rooted at a query name, with up to three parameters.
    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        ("[a-z][a-zA-Z]{0,15}", prop::collection::vec(arb_key_part(), 0..3)).prop_map(
            |(root, params)| {
                let mut parts = vec![KeyPart::Str(root)];
                parts.extend(params);
                CacheKey::from_parts(parts)
            },
        )
    }

    /// Between `min` and `max` distinct keys.
    pub fn arb_distinct_keys(min: usize, max: usize) -> impl Strategy<Value = Vec<CacheKey>> {
        prop::collection::btree_set(arb_cache_key(), min..=max)
            .prop_map(|keys| keys.into_iter().collect())
    }

    /// Entity kinds as they appear in URLs: lowercase words joined by `_`.
    pub fn arb_kind() -> impl Strategy<Value = String> {
        "[a-z]{1,8}(_[a-z]{1,8})?"
    }

    /// Ids in canonical form: numbers, or text that is not a canonical
    /// number (and may contain `:`).
    pub fn arb_entity_id() -> impl Strategy<Value = EntityId> {
        prop_oneof![
            any::<i64>().prop_map(EntityId::Number),
            "[a-zA-Z][a-zA-Z0-9:_-]{0,15}".prop_map(EntityId::from),
        ]
    }

    pub fn arb_entity_ref() -> impl Strategy<Value = EntityRef> {
        (arb_kind(), arb_entity_id()).prop_map(|(kind, id)| EntityRef { kind, id })
    }

    /// A JSON entity with a numeric `id` and a few scalar fields.
    pub fn arb_json_entity() -> impl Strategy<Value = Value> {
        (
            1i64..10_000,
            "[a-zA-Z ]{0,20}",
            -1000i64..1000,
            any::<bool>(),
        )
            .prop_map(|(id, name, amount, active)| {
                serde_json::json!({
                    "id": id,
                    "name": name,
                    "amount": amount,
                    "active": active,
                })
            })
    }

    /// Any cache value: absent, a single entity, or a collection.
    pub fn arb_cache_value() -> impl Strategy<Value = Option<Value>> {
        prop_oneof![
            Just(None),
            arb_json_entity().prop_map(Some),
            prop::collection::vec(arb_json_entity(), 0..5).prop_map(|items| Some(Value::Array(items))),
        ]
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built entities for the review and billing scenarios.

    use super::*;
    use serde_json::json;

    pub const PROJECT_ID: i64 = 7;

    /// A review row as the reviews tab lists it.
    pub fn review(id: i64, due_date: &str) -> Value {
        json!({
            "id": id,
            "title": format!("Review {}", id),
            "status": "open",
            "due_date": due_date,
        })
    }

    /// A billing line with a numeric amount.
    pub fn billing_line(id: i64, amount: i64) -> Value {
        json!({
            "id": id,
            "description": format!("Line {}", id),
            "amount": amount,
        })
    }

    pub fn service(id: i64, name: &str) -> Value {
        json!({
            "id": id,
            "name": name,
            "status": "active",
        })
    }

    /// Collection of three reviews; review 12 is due 2024-03-01.
    pub fn project_reviews() -> Value {
        json!([
            review(11, "2024-02-20"),
            review(12, "2024-03-01"),
            review(13, "2024-04-10"),
        ])
    }

    pub fn project_services() -> Value {
        json!([service(42, "Ingest"), service(43, "Billing export")])
    }

    /// The server's `{ "error": ... }` failure payload.
    pub fn error_payload(message: &str) -> Value {
        json!({ "error": message })
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over JSON entities.

    use super::*;

    /// Find the entity with `id` in a collection.
    pub fn find_by_id(collection: &Value, id: i64) -> Option<&Value> {
        collection
            .as_array()?
            .iter()
            .find(|item| item.get("id").and_then(Value::as_i64) == Some(id))
    }

    /// Assert that entity `id` in `collection` has `field == expected`.
    pub fn assert_field(collection: &Value, id: i64, field: &str, expected: Value) {
        let entity = find_by_id(collection, id)
            .unwrap_or_else(|| panic!("entity {} not found in {}", id, collection));
        assert_eq!(
            entity.get(field),
            Some(&expected),
            "field {:?} of entity {}",
            field,
            id
        );
    }
}
