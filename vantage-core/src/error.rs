//! Error types for Vantage operations

use std::fmt;
use thiserror::Error;

/// What went wrong while reading a query result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// The request never produced a response.
    Network,
    /// The server answered with a non-success status.
    Server { status: u16 },
    /// The response body could not be decoded.
    Decode,
    /// The fetch was abandoned before it resolved.
    Cancelled,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::Network => f.write_str("network"),
            FetchErrorKind::Server { status } => write!(f, "server {}", status),
            FetchErrorKind::Decode => f.write_str("decode"),
            FetchErrorKind::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// A read failed. The cache keeps the last good value next to it.
///
/// Clone-able because one failure is delivered to every reader that joined
/// the same in-flight fetch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Fetch failed ({kind}): {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Network, message)
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Server { status }, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Decode, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Cancelled, message)
    }
}

/// What went wrong while committing a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationErrorKind {
    Network,
    Server { status: u16 },
    /// The server refused the write (validation, conflict, permissions).
    Rejected { status: u16 },
    Decode,
    /// The task driving the write stopped before the outcome was known.
    Aborted,
}

impl fmt::Display for MutationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationErrorKind::Network => f.write_str("network"),
            MutationErrorKind::Server { status } => write!(f, "server {}", status),
            MutationErrorKind::Rejected { status } => write!(f, "rejected {}", status),
            MutationErrorKind::Decode => f.write_str("decode"),
            MutationErrorKind::Aborted => f.write_str("aborted"),
        }
    }
}

/// A write failed after its effect was shown optimistically.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Mutation failed ({kind}): {cause}")]
pub struct MutationError {
    pub kind: MutationErrorKind,
    /// The `error` field of the server payload, verbatim, when there was one.
    pub server_message: Option<String>,
    /// Diagnostic detail for logs.
    pub cause: String,
}

impl MutationError {
    pub fn new(kind: MutationErrorKind, cause: impl Into<String>) -> Self {
        Self {
            kind,
            server_message: None,
            cause: cause.into(),
        }
    }

    pub fn network(cause: impl Into<String>) -> Self {
        Self::new(MutationErrorKind::Network, cause)
    }

    pub fn server(status: u16, cause: impl Into<String>) -> Self {
        Self::new(MutationErrorKind::Server { status }, cause)
    }

    pub fn rejected(status: u16, cause: impl Into<String>) -> Self {
        Self::new(MutationErrorKind::Rejected { status }, cause)
    }

    pub fn decode(cause: impl Into<String>) -> Self {
        Self::new(MutationErrorKind::Decode, cause)
    }

    pub fn aborted(cause: impl Into<String>) -> Self {
        Self::new(MutationErrorKind::Aborted, cause)
    }

    pub fn with_server_message(mut self, message: impl Into<String>) -> Self {
        self.server_message = Some(message.into());
        self
    }

    /// Text to show the user: the server's message, else `fallback`.
    pub fn user_message(&self, fallback: &str) -> String {
        match &self.server_message {
            Some(message) if !message.trim().is_empty() => message.clone(),
            _ => fallback.to_string(),
        }
    }
}

/// The URL did not carry a usable selection. Never shown to users.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectionParseError {
    #[error("No selection parameter present")]
    Missing,

    #[error("Malformed selection: {0:?}")]
    Malformed(String),

    #[error("Entity kind {0:?} is not allowed in the active tab")]
    KindNotAllowed(String),
}

/// Master error type for all Vantage errors.
#[derive(Debug, Clone, Error)]
pub enum VantageError {
    #[error("{0}")]
    Fetch(#[from] FetchError),

    #[error("{0}")]
    Mutation(#[from] MutationError),

    #[error("Selection error: {0}")]
    Selection(#[from] SelectionParseError),
}

/// Result type alias for Vantage operations.
pub type VantageResult<T> = Result<T, VantageError>;

// =============================================================================
// TESTS
// =============================================================================
