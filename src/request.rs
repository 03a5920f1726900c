//! Request types.
//!
//! A [`Request`] is immutable once created: the orchestrator, router, and
//! experts all read it, nobody mutates it. Metadata fields carry documented
//! defaults so callers only set what they know.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Unique identifier for a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of work the request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Analysis,
    Generation,
    Review,
    Deployment,
    Config,
    Maintenance,
    Custom,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Generation => "generation",
            Self::Review => "review",
            Self::Deployment => "deployment",
            Self::Config => "config",
            Self::Maintenance => "maintenance",
            Self::Custom => "custom",
        }
    }

    /// Kinds that mutate running systems rather than just reading them.
    pub fn is_destructive(&self) -> bool {
        matches!(self, Self::Deployment | Self::Config | Self::Maintenance)
    }
}

/// Declared risk level of the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Target environment of the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Staging => "staging",
            Self::Prod => "prod",
        }
    }
}

/// How widely a mistake would propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemImpact {
    Low,
    Medium,
    High,
}

impl SystemImpact {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Sensitivity of the data the request touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSensitivity {
    Public,
    Internal,
    Confidential,
    Restricted,
}

/// Scheduling priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

/// Declared role of the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequesterRole {
    Admin,
    Developer,
    User,
}

/// Request metadata with documented defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Estimated complexity in [0, 1]. Default 0.5.
    pub complexity: f64,
    /// Default [`RiskLevel::Medium`].
    pub risk_level: RiskLevel,
    /// Default [`Environment::Dev`].
    pub environment: Environment,
    /// Default [`DataSensitivity::Internal`].
    pub data_sensitivity: DataSensitivity,
    /// Default [`SystemImpact::Low`].
    pub system_impact: SystemImpact,
    /// Default [`RequesterRole::User`].
    pub requester_role: RequesterRole,
}

impl Default for RequestMetadata {
    fn default() -> Self {
        Self {
            complexity: 0.5,
            risk_level: RiskLevel::Medium,
            environment: Environment::Dev,
            data_sensitivity: DataSensitivity::Internal,
            system_impact: SystemImpact::Low,
            requester_role: RequesterRole::User,
        }
    }
}

/// A unit of work submitted to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub kind: RequestKind,
    /// Free-form payload; experts interpret it.
    pub payload: Value,
    /// Free-form caller context (requester id, correlation ids, ...).
    pub context: HashMap<String, Value>,
    pub metadata: RequestMetadata,
    pub priority: Priority,
    /// Request-level deadline in milliseconds; engine default applies if unset.
    pub deadline_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl Request {
    /// Create a request with default metadata and normal priority.
    pub fn new(kind: RequestKind, payload: Value) -> Self {
        Self {
            id: RequestId::new(),
            kind,
            payload,
            context: HashMap::new(),
            metadata: RequestMetadata::default(),
            priority: Priority::Normal,
            deadline_ms: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: RequestMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_complexity(mut self, complexity: f64) -> Self {
        self.metadata.complexity = complexity;
        self
    }

    pub fn with_risk_level(mut self, risk: RiskLevel) -> Self {
        self.metadata.risk_level = risk;
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.metadata.environment = environment;
        self
    }

    pub fn with_system_impact(mut self, impact: SystemImpact) -> Self {
        self.metadata.system_impact = impact;
        self
    }

    pub fn with_requester_role(mut self, role: RequesterRole) -> Self {
        self.metadata.requester_role = role;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// The payload as text, for capability extraction and prompt binding.
    pub fn payload_text(&self) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// The requester identity used for session bounding, if declared.
    pub fn requester(&self) -> Option<&str> {
        self.context.get("requester").and_then(|v| v.as_str())
    }

    /// Reject requests the router must never see.
    pub fn validate(&self) -> Result<()> {
        if self.payload.is_null() {
            return Err(Error::invalid_request("payload is required"));
        }
        if let Value::String(s) = &self.payload {
            if s.trim().is_empty() {
                return Err(Error::invalid_request("payload is empty"));
            }
        }
        if !(0.0..=1.0).contains(&self.metadata.complexity) {
            return Err(Error::invalid_request(format!(
                "complexity must be in [0, 1], got {}",
                self.metadata.complexity
            )));
        }
        if let Some(deadline) = self.deadline_ms {
            if deadline == 0 {
                return Err(Error::invalid_request("deadline_ms must be positive"));
            }
        }
        Ok(())
    }
}
