#![allow(dead_code)]

//! In-memory stand-in for the project REST API.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use url::Url;
use vantage_cache::CacheConfig;
use vantage_console::api_client::ApiClientError;
use vantage_console::state::App;
use vantage_console::traits::RemoteApi;
use vantage_test_utils::{fixtures, Gate};

pub const ORIGIN: &str = "https://console.test";

pub fn location(path_and_query: &str) -> Url {
    Url::parse(&format!("{}{}", ORIGIN, path_and_query)).unwrap()
}

pub fn app_at(api: &Arc<FakeApi>, path_and_query: &str) -> App {
    let api: Arc<dyn RemoteApi> = api.clone();
    App::new(api, CacheConfig::default(), location(path_and_query))
}

/// A failure injected for `METHOD path` until healed.
#[derive(Debug, Clone)]
struct Failure {
    status: u16,
    message: Option<String>,
}

#[derive(Default)]
struct FakeState {
    /// Collection path -> entities.
    collections: HashMap<String, Vec<Value>>,
    documents: HashMap<String, Value>,
    failures: HashMap<String, Failure>,
    /// Gates the next requests to `METHOD path` wait on, in arrival order.
    holds: HashMap<String, VecDeque<Gate>>,
    requests: Vec<String>,
    next_id: i64,
}

#[derive(Default)]
pub struct FakeApi {
    state: Mutex<FakeState>,
}

impl FakeApi {
    /// Project 7 with services 42 and 43, three reviews and empty lists
    /// everywhere else.
    pub fn with_project() -> Arc<Self> {
        let api = Self::default();
        {
            let mut state = api.state.lock().unwrap();
            state.next_id = 100;
            let project = format!("/projects/{}", fixtures::PROJECT_ID);
            let seeded = [
                ("services", fixtures::project_services()),
                ("reviews", fixtures::project_reviews()),
                ("tasks", json!([])),
                ("issues", json!([])),
                ("quality-rows", json!([])),
                ("billing-lines", json!([fixtures::billing_line(3, 1200)])),
                ("bids", json!([])),
            ];
            for (segment, items) in seeded {
                let items = items.as_array().cloned().unwrap_or_default();
                state
                    .collections
                    .insert(format!("{}/{}", project, segment), items);
            }
            state.documents.insert(
                format!("{}/overview", project),
                json!({ "name": "Harbour", "open_reviews": 3 }),
            );
        }
        Arc::new(api)
    }

    /// Fail every `method path` request with `status` until healed.
    pub fn fail(&self, method: &str, path: &str, status: u16, message: Option<&str>) {
        self.state.lock().unwrap().failures.insert(
            format!("{} {}", method, path),
            Failure {
                status,
                message: message.map(str::to_string),
            },
        );
    }

    pub fn heal(&self, method: &str, path: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .remove(&format!("{} {}", method, path));
    }

    /// Keep the next not-yet-held `method path` request waiting until the
    /// returned gate opens.
    pub fn hold(&self, method: &str, path: &str) -> Gate {
        let gate = Gate::new();
        self.state
            .lock()
            .unwrap()
            .holds
            .entry(format!("{} {}", method, path))
            .or_default()
            .push_back(gate.clone());
        gate
    }

    async fn admit(&self, method: &str, path: &str) {
        let gate = self
            .state
            .lock()
            .unwrap()
            .holds
            .get_mut(&format!("{} {}", method, path))
            .and_then(VecDeque::pop_front);
        if let Some(gate) = gate {
            gate.wait().await;
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn request_count(&self, request: &str) -> usize {
        self.requests().iter().filter(|r| *r == request).count()
    }

    pub fn collection(&self, path: &str) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .collections
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    fn begin(&self, method: &str, path: &str) -> Result<std::sync::MutexGuard<'_, FakeState>, ApiClientError> {
        let mut state = self.state.lock().unwrap();
        let request = format!("{} {}", method, path);
        state.requests.push(request.clone());
        if let Some(failure) = state.failures.get(&request) {
            return Err(match &failure.message {
                Some(message) => ApiClientError::server_message(failure.status, message.clone()),
                None => ApiClientError::Server {
                    status: failure.status,
                    message: None,
                    body: "<html>error</html>".to_string(),
                },
            });
        }
        Ok(state)
    }
}

fn not_found(path: &str) -> ApiClientError {
    ApiClientError::server_message(404, format!("{} not found", path))
}

/// `/segment/id` -> (collection path, index) of the entity.
fn locate(state: &FakeState, path: &str) -> Option<(String, usize)> {
    let (segment, id) = path.trim_start_matches('/').split_once('/')?;
    let suffix = format!("/{}", segment);
    state
        .collections
        .iter()
        .filter(|(collection, _)| collection.ends_with(&suffix))
        .find_map(|(collection, items)| {
            items
                .iter()
                .position(|item| item.get("id").map(id_text).as_deref() == Some(id))
                .map(|index| (collection.clone(), index))
        })
}

fn id_text(id: &Value) -> String {
    match id {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl RemoteApi for FakeApi {
    async fn fetch_json(&self, path: &str) -> Result<Value, ApiClientError> {
        self.admit("GET", path).await;
        let state = self.begin("GET", path)?;
        if let Some(items) = state.collections.get(path) {
            return Ok(Value::Array(items.clone()));
        }
        if let Some(document) = state.documents.get(path) {
            return Ok(document.clone());
        }
        let (collection, index) = locate(&state, path).ok_or_else(|| not_found(path))?;
        Ok(state.collections[&collection][index].clone())
    }

    async fn create(&self, path: &str, body: &Value) -> Result<Value, ApiClientError> {
        self.admit("POST", path).await;
        let mut state = self.begin("POST", path)?;
        let id = state.next_id;
        state.next_id += 1;
        let mut entity: Map<String, Value> = body.as_object().cloned().unwrap_or_default();
        entity.insert("id".to_string(), json!(id));
        let entity = Value::Object(entity);
        state
            .collections
            .get_mut(path)
            .ok_or_else(|| not_found(path))?
            .push(entity.clone());
        Ok(entity)
    }

    async fn update(&self, path: &str, patch: &Value) -> Result<Value, ApiClientError> {
        self.admit("PATCH", path).await;
        let mut state = self.begin("PATCH", path)?;
        let (collection, index) = locate(&state, path).ok_or_else(|| not_found(path))?;
        let items = state.collections.get_mut(&collection).ok_or_else(|| not_found(path))?;
        if let (Some(entity), Some(fields)) = (items[index].as_object_mut(), patch.as_object()) {
            for (name, value) in fields {
                entity.insert(name.clone(), value.clone());
            }
            entity.insert("revision".to_string(), json!(2));
        }
        Ok(items[index].clone())
    }

    async fn delete(&self, path: &str) -> Result<(), ApiClientError> {
        self.admit("DELETE", path).await;
        let mut state = self.begin("DELETE", path)?;
        let (collection, index) = locate(&state, path).ok_or_else(|| not_found(path))?;
        if let Some(items) = state.collections.get_mut(&collection) {
            items.remove(index);
        }
        Ok(())
    }
}

/// Let spawned background fetches run to completion.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
