//! Error Types
//!
//! `RelayError` is the single error type flowing through a chat turn. It is
//! `Clone` because the same failure is delivered to both branches of the
//! shared token stream.

use thiserror::Error;

use crate::store::StoreError;

/// Message used when a setup failure carries no text of its own
pub const UNKNOWN_ERROR: &str = "Unknown error";

/// Errors raised while relaying a chat turn
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    /// Malformed or empty input, rejected before any streaming begins
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The model backend could not be set up for this query
    #[error("AI response failed: {0}")]
    ResponseFailed(String),

    /// The model backend failed after streaming had started
    #[error("{0}")]
    Upstream(String),

    /// The conversation store rejected an operation
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Unexpected failure inside the relay itself
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Wrap a backend setup failure, falling back to [`UNKNOWN_ERROR`]
    pub fn response_failed(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.trim().is_empty() {
            Self::ResponseFailed(UNKNOWN_ERROR.to_string())
        } else {
            Self::ResponseFailed(message)
        }
    }

    /// The bare message, without the variant prefix
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Validation(m) | Self::ResponseFailed(m) | Self::Upstream(m) | Self::Internal(m) => {
                m.clone()
            }
            Self::Storage(e) => e.to_string(),
        }
    }

    /// Short tag used when reporting the error to metrics
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::ResponseFailed(_) => "response_failed",
            Self::Upstream(_) => "upstream",
            Self::Storage(e) => e.kind(),
            Self::Internal(_) => "internal",
        }
    }
}
