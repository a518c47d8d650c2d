//! Error types for the console.

use crate::api_client::ApiClientError;
use crate::config::ConfigError;
use crate::persistence::PersistenceError;

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Api(#[from] ApiClientError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("Logging setup failed: {0}")]
    Telemetry(String),
}

/// A user action that could not be carried out.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("No project is open")]
    NoProject,
    #[error("Unknown entity kind: {0}")]
    UnknownKind(String),
    #[error(transparent)]
    Mutation(#[from] vantage_core::MutationError),
}
