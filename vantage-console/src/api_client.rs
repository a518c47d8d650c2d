//! REST client for the project API.

use crate::config::{AuthConfig, ConsoleConfig};
use crate::traits::RemoteApi;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use vantage_core::{FetchError, MutationError};

#[derive(Debug, thiserror::Error)]
pub enum ApiClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Server error {status}: {}", message.as_deref().unwrap_or(body))]
    Server {
        status: u16,
        /// The `error` field of the payload, when the body had one.
        message: Option<String>,
        body: String,
    },
    #[error("Unexpected response: {0}")]
    InvalidResponse(String),
    #[error("Config error: {0}")]
    Config(String),
}

impl ApiClientError {
    /// A non-2xx answer carrying the server's `{ "error": ... }` payload.
    pub fn server_message(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::Server {
            status,
            body: serde_json::json!({ "error": message }).to_string(),
            message: Some(message),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiClientError::Server { status, .. } => Some(*status),
            ApiClientError::Http(err) => err.status().map(|status| status.as_u16()),
            _ => None,
        }
    }
}

impl From<ApiClientError> for FetchError {
    fn from(err: ApiClientError) -> Self {
        match err {
            ApiClientError::Server {
                status,
                message,
                body,
            } => FetchError::server(status, message.unwrap_or(body)),
            ApiClientError::Http(err) if err.is_decode() => FetchError::decode(err.to_string()),
            ApiClientError::Http(err) => match err.status() {
                Some(status) => FetchError::server(status.as_u16(), err.to_string()),
                None => FetchError::network(err.to_string()),
            },
            ApiClientError::Serde(err) => FetchError::decode(err.to_string()),
            ApiClientError::InvalidResponse(message) => FetchError::decode(message),
            ApiClientError::Config(message) => FetchError::network(message),
        }
    }
}

impl From<ApiClientError> for MutationError {
    fn from(err: ApiClientError) -> Self {
        match err {
            ApiClientError::Server {
                status,
                message,
                body,
            } => {
                let base = if (400..500).contains(&status) {
                    MutationError::rejected(status, body)
                } else {
                    MutationError::server(status, body)
                };
                match message {
                    Some(message) => base.with_server_message(message),
                    None => base,
                }
            }
            ApiClientError::Http(err) if err.is_decode() => MutationError::decode(err.to_string()),
            ApiClientError::Http(err) => MutationError::network(err.to_string()),
            ApiClientError::Serde(err) => MutationError::decode(err.to_string()),
            ApiClientError::InvalidResponse(message) => MutationError::decode(message),
            ApiClientError::Config(message) => MutationError::network(message),
        }
    }
}

/// Failure body of every endpoint. Extra fields are ignored.
#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: String,
}

#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    auth_header: HeaderMap,
}

impl RestClient {
    pub fn new(config: &ConsoleConfig) -> Result<Self, ApiClientError> {
        let timeout = Duration::from_millis(config.request_timeout_ms);
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        let auth_header = build_auth_headers(&config.auth)?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            auth_header,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn parse_response(&self, response: reqwest::Response) -> Result<Value, ApiClientError> {
        let status = response.status();
        let text = response.text().await?;
        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return Ok(serde_json::from_str(&text)?);
        }
        let message = serde_json::from_str::<ErrorPayload>(&text)
            .ok()
            .map(|payload| payload.error);
        Err(ApiClientError::Server {
            status: status.as_u16(),
            message,
            body: text,
        })
    }
}

#[async_trait]
impl RemoteApi for RestClient {
    async fn fetch_json(&self, path: &str) -> Result<Value, ApiClientError> {
        tracing::debug!(method = "GET", path, "api request");
        let response = self
            .client
            .get(self.url(path))
            .headers(self.auth_header.clone())
            .send()
            .await?;
        self.parse_response(response).await
    }

    async fn create(&self, path: &str, body: &Value) -> Result<Value, ApiClientError> {
        tracing::debug!(method = "POST", path, "api request");
        let response = self
            .client
            .post(self.url(path))
            .headers(self.auth_header.clone())
            .json(body)
            .send()
            .await?;
        self.parse_response(response).await
    }

    async fn update(&self, path: &str, patch: &Value) -> Result<Value, ApiClientError> {
        tracing::debug!(method = "PATCH", path, "api request");
        let response = self
            .client
            .patch(self.url(path))
            .headers(self.auth_header.clone())
            .json(patch)
            .send()
            .await?;
        self.parse_response(response).await
    }

    async fn delete(&self, path: &str) -> Result<(), ApiClientError> {
        tracing::debug!(method = "DELETE", path, "api request");
        let response = self
            .client
            .delete(self.url(path))
            .headers(self.auth_header.clone())
            .send()
            .await?;
        self.parse_response(response).await.map(|_| ())
    }
}

fn build_auth_headers(auth: &AuthConfig) -> Result<HeaderMap, ApiClientError> {
    let mut headers = HeaderMap::new();
    if let Some(api_key) = &auth.api_key {
        headers.insert(
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_str(api_key).map_err(|e| ApiClientError::Config(e.to_string()))?,
        );
    }
    if let Some(token) = &auth.bearer_token {
        let value = format!("Bearer {}", token);
        headers.insert(
            HeaderName::from_static("authorization"),
            HeaderValue::from_str(&value).map_err(|e| ApiClientError::Config(e.to_string()))?,
        );
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vantage_core::{FetchErrorKind, MutationErrorKind};

    #[test]
    fn test_rejection_keeps_server_message() {
        let err = MutationError::from(ApiClientError::server_message(
            422,
            "Due date must be in the future.",
        ));
        assert_eq!(err.kind, MutationErrorKind::Rejected { status: 422 });
        assert_eq!(
            err.server_message.as_deref(),
            Some("Due date must be in the future.")
        );
    }

    #[test]
    fn test_server_failure_without_payload() {
        let err = MutationError::from(ApiClientError::Server {
            status: 502,
            message: None,
            body: "<html>Bad gateway</html>".to_string(),
        });
        assert_eq!(err.kind, MutationErrorKind::Server { status: 502 });
        assert_eq!(err.server_message, None);
        assert_eq!(err.user_message("Failed to update review."), "Failed to update review.");
    }

    #[test]
    fn test_fetch_error_mapping() {
        let err = FetchError::from(ApiClientError::server_message(503, "maintenance"));
        assert_eq!(err.kind, FetchErrorKind::Server { status: 503 });
        assert_eq!(err.message, "maintenance");

        let err = FetchError::from(ApiClientError::InvalidResponse("not json".into()));
        assert_eq!(err.kind, FetchErrorKind::Decode);
    }

    #[test]
    fn test_auth_headers() {
        let headers = build_auth_headers(&AuthConfig {
            api_key: Some("key".to_string()),
            bearer_token: Some("token".to_string()),
        })
        .unwrap();
        assert_eq!(headers.get("x-api-key").unwrap(), "key");
        assert_eq!(headers.get("authorization").unwrap(), "Bearer token");
    }
}
