//! Routing decision types and feature extraction.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::human::HumanPrompt;
use crate::registry::{extract_domain_tags, ExpertId};
use crate::request::{
    DataSensitivity, Environment, Priority, Request, RequesterRole, RiskLevel, SystemImpact,
};

/// How a request gets serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingOutcome {
    Auto,
    HumanRequired,
    ExpertConsultation,
    Conditional,
}

impl RoutingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::HumanRequired => "human_required",
            Self::ExpertConsultation => "expert_consultation",
            Self::Conditional => "conditional",
        }
    }

    /// All outcomes in lexicographic name order, the documented tie-break
    /// order for the hybrid vote.
    pub fn all() -> [RoutingOutcome; 4] {
        [
            Self::Auto,
            Self::Conditional,
            Self::ExpertConsultation,
            Self::HumanRequired,
        ]
    }
}

impl std::fmt::Display for RoutingOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One strategy's candidate decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyVote {
    pub outcome: RoutingOutcome,
    pub confidence: f64,
    pub rationale: String,
}

impl StrategyVote {
    pub fn new(outcome: RoutingOutcome, confidence: f64, rationale: impl Into<String>) -> Self {
        Self {
            outcome,
            confidence: confidence.clamp(0.0, 1.0),
            rationale: rationale.into(),
        }
    }
}

/// Predicate evaluated at dispatch time for CONDITIONAL decisions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    ComplexityAbove(f64),
    RiskAtLeast(RiskLevel),
    ProdEnvironment,
}

impl Condition {
    pub fn evaluate(&self, request: &Request) -> bool {
        match self {
            Self::ComplexityAbove(threshold) => request.metadata.complexity > *threshold,
            Self::RiskAtLeast(level) => request.metadata.risk_level >= *level,
            Self::ProdEnvironment => request.metadata.environment == Environment::Prod,
        }
    }
}

/// Branches taken by a CONDITIONAL decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConditionalPolicy {
    pub condition: Condition,
    /// Branch when the condition holds. Never `Conditional` itself.
    pub when_true: RoutingOutcome,
    /// Branch when it does not.
    pub when_false: RoutingOutcome,
}

impl ConditionalPolicy {
    pub fn branch(&self, request: &Request) -> RoutingOutcome {
        if self.condition.evaluate(request) {
            self.when_true
        } else {
            self.when_false
        }
    }
}

/// The router's verdict for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub request_id: String,
    pub outcome: RoutingOutcome,
    /// Margin of the winning outcome over the runner-up, in [0, 1].
    pub confidence: f64,
    pub rationale: String,
    /// Experts to consult, for EXPERT_CONSULTATION.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selected_experts: Vec<ExpertId>,
    /// Prompt to show, for HUMAN_REQUIRED (and conditional human branches).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_prompt: Option<HumanPrompt>,
    /// Dispatch-time predicate, for CONDITIONAL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditional: Option<ConditionalPolicy>,
    /// Runner-up outcome, used when the primary path fails.
    pub fallback_outcome: RoutingOutcome,
    /// Recommendation the aggregator uses directly on the AUTO path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_recommendation: Option<Value>,
}

/// Fixed-width numeric features for the history and learned strategies.
///
/// Field order (documented so stored observations stay comparable):
/// complexity, risk, environment, system impact, data sensitivity, priority,
/// destructive kind, admin requester, domain-tag density.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector(pub Vec<f64>);

impl FeatureVector {
    pub const DIM: usize = 9;

    pub fn from_request(request: &Request) -> Self {
        let m = &request.metadata;
        let risk = match m.risk_level {
            RiskLevel::Low => 0.0,
            RiskLevel::Medium => 1.0 / 3.0,
            RiskLevel::High => 2.0 / 3.0,
            RiskLevel::Critical => 1.0,
        };
        let environment = match m.environment {
            Environment::Dev => 0.0,
            Environment::Staging => 0.5,
            Environment::Prod => 1.0,
        };
        let impact = match m.system_impact {
            SystemImpact::Low => 0.0,
            SystemImpact::Medium => 0.5,
            SystemImpact::High => 1.0,
        };
        let sensitivity = match m.data_sensitivity {
            DataSensitivity::Public => 0.0,
            DataSensitivity::Internal => 1.0 / 3.0,
            DataSensitivity::Confidential => 2.0 / 3.0,
            DataSensitivity::Restricted => 1.0,
        };
        let priority = match request.priority {
            Priority::Low => 0.0,
            Priority::Normal => 1.0 / 3.0,
            Priority::High => 2.0 / 3.0,
            Priority::Urgent => 1.0,
        };
        let destructive = if request.kind.is_destructive() { 1.0 } else { 0.0 };
        let admin = if m.requester_role == RequesterRole::Admin {
            1.0
        } else {
            0.0
        };
        let tags = extract_domain_tags(&request.payload_text()).len() as f64 / 7.0;

        Self(vec![
            m.complexity,
            risk,
            environment,
            impact,
            sensitivity,
            priority,
            destructive,
            admin,
            tags,
        ])
    }

    /// Euclidean distance between two vectors of the same width.
    pub fn distance(&self, other: &FeatureVector) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}
