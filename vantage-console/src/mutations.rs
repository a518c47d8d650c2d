//! Entity writes issued from the console.
//!
//! Each write names the collection and detail keys it touches, shows its
//! effect on them immediately, and folds the server's copy of the entity
//! back in on success.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;
use vantage_cache::Mutation;
use vantage_core::{CacheKey, EntityId, EntityRef, MutationError};

use crate::queries::EntityQuery;
use crate::traits::RemoteApi;

/// True if `entity["id"]` denotes `id`, whether the server sent it as a
/// number or as text.
pub fn matches_id(entity: &Value, id: &EntityId) -> bool {
    match entity.get("id") {
        Some(Value::Number(n)) => match (n.as_i64(), id) {
            (Some(n), EntityId::Number(expected)) => n == *expected,
            _ => EntityId::parse(&n.to_string()).as_ref() == Some(id),
        },
        Some(Value::String(text)) => EntityId::parse(text).as_ref() == Some(id),
        _ => false,
    }
}

/// The id of a server entity, canonicalized.
pub fn entity_id(entity: &Value) -> Option<EntityId> {
    match entity.get("id")? {
        Value::Number(n) => match n.as_i64() {
            Some(n) => Some(EntityId::Number(n)),
            None => EntityId::parse(&n.to_string()),
        },
        Value::String(text) => EntityId::parse(text),
        _ => None,
    }
}

/// Shallow merge of `patch` into `target`. Non-objects are replaced.
fn merge(target: &Value, patch: &Value) -> Value {
    match (target, patch) {
        (Value::Object(base), Value::Object(fields)) => {
            let mut merged = base.clone();
            for (name, value) in fields {
                merged.insert(name.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => patch.clone(),
    }
}

/// Apply `f` to the entity with `id` in a collection value.
fn map_entity<F>(collection: Option<&Value>, id: &EntityId, f: F) -> Value
where
    F: Fn(&Value) -> Value,
{
    match collection {
        Some(Value::Array(items)) => Value::Array(
            items
                .iter()
                .map(|item| if matches_id(item, id) { f(item) } else { item.clone() })
                .collect(),
        ),
        Some(other) => other.clone(),
        None => Value::Null,
    }
}

fn failure_for(action: &str, kind: &str) -> String {
    format!("Failed to {} {}.", action, kind.replace('_', " "))
}

/// Partial update of one entity.
pub struct UpdateEntity {
    api: Arc<dyn RemoteApi>,
    target: EntityRef,
    patch: Value,
    collection_key: Option<CacheKey>,
    detail_key: Option<CacheKey>,
    path: String,
    failure: String,
}

impl UpdateEntity {
    /// Touches only the keys that hold the entity: `collection_key` is the
    /// loaded list it is shown in, `detail_loaded` whether its own detail
    /// query has a value.
    pub fn new(
        api: Arc<dyn RemoteApi>,
        query: &EntityQuery,
        target: EntityRef,
        patch: Map<String, Value>,
        collection_key: Option<CacheKey>,
        detail_loaded: bool,
    ) -> Self {
        let detail_key = detail_loaded.then(|| query.detail_key(&target.id));
        Self {
            api,
            path: query.detail_path(&target.id),
            failure: failure_for("update", &target.kind),
            target,
            patch: Value::Object(patch),
            collection_key,
            detail_key,
        }
    }

    pub fn target(&self) -> &EntityRef {
        &self.target
    }
}

#[async_trait]
impl Mutation<Value> for UpdateEntity {
    type Output = Value;

    fn affected_keys(&self) -> Vec<CacheKey> {
        self.collection_key
            .iter()
            .chain(self.detail_key.iter())
            .cloned()
            .collect()
    }

    fn apply(&self, key: &CacheKey, current: Option<&Value>) -> Value {
        if Some(key) == self.detail_key.as_ref() {
            return match current {
                Some(entity) => merge(entity, &self.patch),
                None => Value::Null,
            };
        }
        map_entity(current, &self.target.id, |entity| merge(entity, &self.patch))
    }

    async fn execute(&self) -> Result<Value, MutationError> {
        Ok(self.api.update(&self.path, &self.patch).await?)
    }

    fn reconcile(&self, key: &CacheKey, output: &Value, current: Option<&Value>) -> Option<Value> {
        if !output.is_object() {
            return None;
        }
        if Some(key) == self.detail_key.as_ref() {
            return Some(output.clone());
        }
        if Some(key) == self.collection_key.as_ref() {
            return Some(map_entity(current, &self.target.id, |_| output.clone()));
        }
        None
    }

    fn failure_message(&self) -> &str {
        &self.failure
    }
}

/// Creation of a new entity in a project collection.
///
/// Until the server answers, a loaded collection shows a placeholder under
/// a temporary `tmp-` id. Collections that were never loaded are left
/// alone.
pub struct CreateEntity {
    api: Arc<dyn RemoteApi>,
    kind: String,
    body: Value,
    temp_id: String,
    collection_key: Option<CacheKey>,
    path: String,
    failure: String,
}

impl CreateEntity {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        query: &EntityQuery,
        project_id: i64,
        body: Map<String, Value>,
        collection_loaded: bool,
    ) -> Self {
        Self {
            api,
            kind: query.kind.to_string(),
            body: Value::Object(body),
            temp_id: format!("tmp-{}", Uuid::now_v7()),
            collection_key: collection_loaded.then(|| query.collection_key(project_id)),
            path: query.collection_path(project_id),
            failure: failure_for("create", query.kind),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn temp_id(&self) -> &str {
        &self.temp_id
    }

    fn placeholder(&self) -> Value {
        let mut entity = match &self.body {
            Value::Object(fields) => fields.clone(),
            _ => Map::new(),
        };
        entity.insert("id".to_string(), Value::String(self.temp_id.clone()));
        Value::Object(entity)
    }

    fn is_placeholder(&self, entity: &Value) -> bool {
        entity.get("id").and_then(Value::as_str) == Some(self.temp_id.as_str())
    }
}

#[async_trait]
impl Mutation<Value> for CreateEntity {
    type Output = Value;

    fn affected_keys(&self) -> Vec<CacheKey> {
        self.collection_key.iter().cloned().collect()
    }

    fn apply(&self, _key: &CacheKey, current: Option<&Value>) -> Value {
        let mut items = match current {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => return other.clone(),
            None => Vec::new(),
        };
        items.push(self.placeholder());
        Value::Array(items)
    }

    async fn execute(&self) -> Result<Value, MutationError> {
        Ok(self.api.create(&self.path, &self.body).await?)
    }

    fn reconcile(&self, _key: &CacheKey, output: &Value, current: Option<&Value>) -> Option<Value> {
        if entity_id(output).is_none() {
            return None;
        }
        let Some(Value::Array(items)) = current else {
            return None;
        };
        let mut replaced = false;
        let mut next: Vec<Value> = items
            .iter()
            .map(|item| {
                if self.is_placeholder(item) {
                    replaced = true;
                    output.clone()
                } else {
                    item.clone()
                }
            })
            .collect();
        if !replaced {
            next.push(output.clone());
        }
        Some(Value::Array(next))
    }

    fn failure_message(&self) -> &str {
        &self.failure
    }
}

/// Deletion of one entity. A loaded collection drops it at once and is
/// refetched afterwards.
pub struct DeleteEntity {
    api: Arc<dyn RemoteApi>,
    target: EntityRef,
    collection_key: Option<CacheKey>,
    path: String,
    failure: String,
}

impl DeleteEntity {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        query: &EntityQuery,
        project_id: i64,
        target: EntityRef,
        collection_loaded: bool,
    ) -> Self {
        Self {
            api,
            collection_key: collection_loaded.then(|| query.collection_key(project_id)),
            path: query.detail_path(&target.id),
            failure: failure_for("delete", &target.kind),
            target,
        }
    }

    pub fn target(&self) -> &EntityRef {
        &self.target
    }
}

#[async_trait]
impl Mutation<Value> for DeleteEntity {
    type Output = ();

    fn affected_keys(&self) -> Vec<CacheKey> {
        self.collection_key.iter().cloned().collect()
    }

    fn apply(&self, _key: &CacheKey, current: Option<&Value>) -> Value {
        match current {
            Some(Value::Array(items)) => Value::Array(
                items
                    .iter()
                    .filter(|item| !matches_id(item, &self.target.id))
                    .cloned()
                    .collect(),
            ),
            Some(other) => other.clone(),
            None => Value::Array(Vec::new()),
        }
    }

    async fn execute(&self) -> Result<(), MutationError> {
        Ok(self.api.delete(&self.path).await?)
    }

    fn failure_message(&self) -> &str {
        &self.failure
    }
}
