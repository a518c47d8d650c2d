//! Common traits for console components

use async_trait::async_trait;
use serde_json::Value;

use crate::api_client::ApiClientError;

/// The remote REST API as the console sees it.
///
/// Paths are relative to the API base URL. Bodies and responses are JSON
/// entities or collections of them.
#[async_trait]
pub trait RemoteApi: Send + Sync + 'static {
    async fn fetch_json(&self, path: &str) -> Result<Value, ApiClientError>;

    /// Create an entity; returns it as the server stored it.
    async fn create(&self, path: &str, body: &Value) -> Result<Value, ApiClientError>;

    /// Partially update an entity; returns it as the server stored it.
    async fn update(&self, path: &str, patch: &Value) -> Result<Value, ApiClientError>;

    async fn delete(&self, path: &str) -> Result<(), ApiClientError>;
}
