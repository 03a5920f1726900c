//! Error types for quorum-core.

use thiserror::Error;

/// Result type alias using quorum-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while processing a request.
#[derive(Error, Debug)]
pub enum Error {
    /// Request failed validation before routing
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A deadline fired (request-, expert-, or session-level)
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Caller-initiated cancellation
    #[error("Operation cancelled")]
    Cancelled,

    /// Consultation was required but no expert is eligible
    #[error("No experts available for request {request_id}")]
    NoExpertsAvailable { request_id: String },

    /// The human interaction service could not be reached
    #[error("Human loop unavailable: {message}")]
    HumanLoopUnavailable { message: String },

    /// Recoverable failure from an expert backend
    #[error("Transient backend error: {0}")]
    TransientBackend(String),

    /// Registry corruption or similar unrecoverable state
    #[error("Internal invariant violated: {0}")]
    InternalInvariant(String),

    /// Observation log or model slot failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create an invalid-request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a no-experts-available error.
    pub fn no_experts(request_id: impl Into<String>) -> Self {
        Self::NoExpertsAvailable {
            request_id: request_id.into(),
        }
    }

    /// Create a human-loop-unavailable error.
    pub fn human_loop_unavailable(message: impl Into<String>) -> Self {
        Self::HumanLoopUnavailable {
            message: message.into(),
        }
    }

    /// Whether the invoker should retry the failed backend call once.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientBackend(_))
    }
}
