//! Query catalogue: which cache keys a view reads and where they come from.
//!
//! Collection keys are `[collection, project_id]`, detail keys are
//! `[detail, id]`. Every key maps to exactly one REST path.

use serde_json::Value;
use std::sync::Arc;
use vantage_cache::{FetchFuture, QueryFetcher};
use vantage_core::{cache_key, CacheKey, EntityId, FetchError, KeyPart};

use crate::nav::WorkspaceTab;
use crate::traits::RemoteApi;

const OVERVIEW_ROOT: &str = "projectOverview";

/// One selectable entity kind and its queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityQuery {
    pub kind: &'static str,
    /// Root of the per-project collection key.
    pub collection: &'static str,
    /// Root of the single-entity key.
    pub detail: &'static str,
    /// REST path segment.
    pub segment: &'static str,
}

const ENTITY_QUERIES: &[EntityQuery] = &[
    EntityQuery {
        kind: "service",
        collection: "projectServices",
        detail: "service",
        segment: "services",
    },
    EntityQuery {
        kind: "task",
        collection: "projectTasks",
        detail: "task",
        segment: "tasks",
    },
    EntityQuery {
        kind: "review",
        collection: "projectReviews",
        detail: "review",
        segment: "reviews",
    },
    EntityQuery {
        kind: "issue",
        collection: "projectIssues",
        detail: "issue",
        segment: "issues",
    },
    EntityQuery {
        kind: "quality_row",
        collection: "projectQuality",
        detail: "qualityRow",
        segment: "quality-rows",
    },
    EntityQuery {
        kind: "billing_line",
        collection: "projectBilling",
        detail: "billingLine",
        segment: "billing-lines",
    },
    EntityQuery {
        kind: "bid",
        collection: "projectBids",
        detail: "bid",
        segment: "bids",
    },
];

pub fn entity_query(kind: &str) -> Option<&'static EntityQuery> {
    ENTITY_QUERIES.iter().find(|query| query.kind == kind)
}

impl EntityQuery {
    pub fn collection_key(&self, project_id: i64) -> CacheKey {
        cache_key![self.collection, project_id]
    }

    pub fn detail_key(&self, id: &EntityId) -> CacheKey {
        cache_key![self.detail, id]
    }

    pub fn collection_path(&self, project_id: i64) -> String {
        format!("/projects/{}/{}", project_id, self.segment)
    }

    pub fn detail_path(&self, id: &EntityId) -> String {
        format!("/{}/{}", self.segment, id)
    }
}

pub fn overview_key(project_id: i64) -> CacheKey {
    cache_key![OVERVIEW_ROOT, project_id]
}

/// Collection keys rendered by `tab`.
pub fn tab_keys(tab: WorkspaceTab, project_id: i64) -> Vec<CacheKey> {
    if tab == WorkspaceTab::Overview {
        return vec![overview_key(project_id)];
    }
    tab.allowed_kinds()
        .iter()
        .filter_map(|kind| entity_query(kind))
        .map(|query| query.collection_key(project_id))
        .collect()
}

/// REST path serving `key`.
pub fn path_for_key(key: &CacheKey) -> Option<String> {
    let [KeyPart::Str(root), param] = key.parts() else {
        return None;
    };
    if root == OVERVIEW_ROOT {
        return match param {
            KeyPart::Int(project_id) => Some(format!("/projects/{}/overview", project_id)),
            _ => None,
        };
    }
    if let Some(query) = ENTITY_QUERIES.iter().find(|q| q.collection == root) {
        return match param {
            KeyPart::Int(project_id) => Some(query.collection_path(*project_id)),
            _ => None,
        };
    }
    let query = ENTITY_QUERIES.iter().find(|q| q.detail == root)?;
    let id = match param {
        KeyPart::Int(n) => EntityId::Number(*n),
        KeyPart::Str(text) => EntityId::parse(text)?,
        KeyPart::Bool(_) => return None,
    };
    Some(query.detail_path(&id))
}

/// Fetches any catalogued key through the remote API.
#[derive(Clone)]
pub struct ApiFetcher {
    api: Arc<dyn RemoteApi>,
}

impl ApiFetcher {
    pub fn new(api: Arc<dyn RemoteApi>) -> Self {
        Self { api }
    }
}

impl QueryFetcher<Value> for ApiFetcher {
    fn fetch(&self, key: &CacheKey) -> FetchFuture<Value> {
        let api = Arc::clone(&self.api);
        let path = path_for_key(key);
        let key = key.clone();
        Box::pin(async move {
            let Some(path) = path else {
                return Err(FetchError::decode(format!("no route for query {}", key)));
            };
            api.fetch_json(&path).await.map_err(FetchError::from)
        })
    }
}
