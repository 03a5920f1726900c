//! Interaction session types for the human loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::HumanTimeouts;

/// Unique identifier for an interaction session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of answer the session solicits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    /// Yes/no confirmation.
    Confirmation,
    /// One of N options.
    Selection,
    /// Free-form fields with validation.
    Input,
    /// One or more files.
    Upload,
}

impl PromptKind {
    /// Default session timeout for this kind.
    pub fn default_timeout_ms(&self, timeouts: &HumanTimeouts) -> u64 {
        match self {
            Self::Confirmation => timeouts.confirmation_ms,
            Self::Selection => timeouts.selection_ms,
            Self::Input => timeouts.input_ms,
            Self::Upload => timeouts.upload_ms,
        }
    }
}

/// A free-form input field in an `Input` prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptField {
    pub name: String,
    pub label: String,
    pub required: bool,
}

/// What gets shown to the human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanPrompt {
    pub kind: PromptKind,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<PromptField>,
}

impl HumanPrompt {
    pub fn confirmation(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: PromptKind::Confirmation,
            title: title.into(),
            message: message.into(),
            options: vec!["confirm".to_string(), "reject".to_string()],
            fields: Vec::new(),
        }
    }

    pub fn selection(
        title: impl Into<String>,
        message: impl Into<String>,
        options: Vec<String>,
    ) -> Self {
        Self {
            kind: PromptKind::Selection,
            title: title.into(),
            message: message.into(),
            options,
            fields: Vec::new(),
        }
    }

    pub fn input(
        title: impl Into<String>,
        message: impl Into<String>,
        fields: Vec<PromptField>,
    ) -> Self {
        Self {
            kind: PromptKind::Input,
            title: title.into(),
            message: message.into(),
            options: Vec::new(),
            fields,
        }
    }
}

/// Session state as reported by the interaction service.
///
/// `Answered`, `Timeout`, and `Cancelled` are terminal: the service never
/// moves a session out of them, and the adapter never asks it to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Answered,
    Timeout,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A correlated request/response interaction with the external service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionSession {
    pub session_id: SessionId,
    pub request_id: String,
    pub prompt: HumanPrompt,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub response: Option<Value>,
    /// Token making re-delivery of the same session safe.
    pub idempotency_token: String,
}

/// The human's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanResponse {
    pub session_id: SessionId,
    pub value: Value,
    pub answered_at: DateTime<Utc>,
}

/// Terminal outcome of asking a human.
#[derive(Debug, Clone, PartialEq)]
pub enum HumanOutcome {
    Answered(HumanResponse),
    TimedOut,
    Cancelled,
}

impl HumanOutcome {
    pub fn response(&self) -> Option<&HumanResponse> {
        match self {
            Self::Answered(response) => Some(response),
            _ => None,
        }
    }
}
