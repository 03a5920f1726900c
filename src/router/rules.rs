//! Declarative routing rules.
//!
//! Rules are ordered; the first whose predicate matches wins within the rule
//! strategy. Predicates are conjunctions over request metadata, so a rule
//! with no conditions matches everything (useful as a trailing default).

use serde::{Deserialize, Serialize};

use crate::request::{Environment, Request, RequestKind, RiskLevel, SystemImpact};
use crate::router::strategies::{RouterState, RoutingStrategy};
use crate::router::types::{
    Condition, ConditionalPolicy, RoutingOutcome, StrategyVote,
};

/// Conjunction of optional metadata conditions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RulePredicate {
    pub environment: Option<Environment>,
    pub kind: Option<RequestKind>,
    pub min_risk: Option<RiskLevel>,
    pub max_risk: Option<RiskLevel>,
    pub system_impact: Option<SystemImpact>,
    pub min_complexity: Option<f64>,
    pub destructive: Option<bool>,
}

impl RulePredicate {
    pub fn matches(&self, request: &Request) -> bool {
        let m = &request.metadata;
        self.environment.map_or(true, |e| e == m.environment)
            && self.kind.map_or(true, |k| k == request.kind)
            && self.min_risk.map_or(true, |r| m.risk_level >= r)
            && self.max_risk.map_or(true, |r| m.risk_level <= r)
            && self.system_impact.map_or(true, |i| i == m.system_impact)
            && self.min_complexity.map_or(true, |c| m.complexity >= c)
            && self
                .destructive
                .map_or(true, |d| d == request.kind.is_destructive())
    }
}

/// One ordered routing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub name: String,
    pub when: RulePredicate,
    pub outcome: RoutingOutcome,
    pub confidence: f64,
    /// Branch policy for rules whose outcome is CONDITIONAL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<ConditionalPolicy>,
}

impl RoutingRule {
    pub fn new(name: impl Into<String>, outcome: RoutingOutcome, confidence: f64) -> Self {
        Self {
            name: name.into(),
            when: RulePredicate::default(),
            outcome,
            confidence,
            policy: None,
        }
    }

    pub fn when_environment(mut self, environment: Environment) -> Self {
        self.when.environment = Some(environment);
        self
    }

    pub fn when_kind(mut self, kind: RequestKind) -> Self {
        self.when.kind = Some(kind);
        self
    }

    pub fn when_min_risk(mut self, risk: RiskLevel) -> Self {
        self.when.min_risk = Some(risk);
        self
    }

    pub fn when_max_risk(mut self, risk: RiskLevel) -> Self {
        self.when.max_risk = Some(risk);
        self
    }

    pub fn when_system_impact(mut self, impact: SystemImpact) -> Self {
        self.when.system_impact = Some(impact);
        self
    }

    pub fn when_min_complexity(mut self, complexity: f64) -> Self {
        self.when.min_complexity = Some(complexity);
        self
    }

    pub fn when_destructive(mut self, destructive: bool) -> Self {
        self.when.destructive = Some(destructive);
        self
    }

    pub fn with_policy(mut self, policy: ConditionalPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// The rule set shipped by default.
///
/// Order matters: earlier rules shadow later ones.
pub fn default_rules() -> Vec<RoutingRule> {
    vec![
        RoutingRule::new(
            "prod-high-impact-needs-human",
            RoutingOutcome::HumanRequired,
            0.95,
        )
        .when_environment(Environment::Prod)
        .when_system_impact(SystemImpact::High),
        RoutingRule::new(
            "critical-risk-needs-human",
            RoutingOutcome::HumanRequired,
            0.95,
        )
        .when_min_risk(RiskLevel::Critical),
        RoutingRule::new(
            "prod-destructive-conditional",
            RoutingOutcome::Conditional,
            0.8,
        )
        .when_environment(Environment::Prod)
        .when_destructive(true)
        .with_policy(ConditionalPolicy {
            condition: Condition::RiskAtLeast(RiskLevel::High),
            when_true: RoutingOutcome::HumanRequired,
            when_false: RoutingOutcome::ExpertConsultation,
        }),
        RoutingRule::new("dev-low-risk-auto", RoutingOutcome::Auto, 0.9)
            .when_environment(Environment::Dev)
            .when_max_risk(RiskLevel::Medium),
        RoutingRule::new(
            "complex-needs-experts",
            RoutingOutcome::ExpertConsultation,
            0.8,
        )
        .when_min_complexity(0.7),
        RoutingRule::new(
            "high-risk-needs-experts",
            RoutingOutcome::ExpertConsultation,
            0.7,
        )
        .when_min_risk(RiskLevel::High),
    ]
}

/// First-match rule evaluation.
pub struct RuleStrategy {
    rules: Vec<RoutingRule>,
}

impl RuleStrategy {
    pub fn new(rules: Vec<RoutingRule>) -> Self {
        Self { rules }
    }

    /// The rule that would decide this request, if any.
    pub fn matching_rule(&self, request: &Request) -> Option<&RoutingRule> {
        self.rules.iter().find(|rule| rule.when.matches(request))
    }
}

impl Default for RuleStrategy {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl RoutingStrategy for RuleStrategy {
    fn name(&self) -> &'static str {
        "rule"
    }

    fn evaluate(&self, request: &Request, _state: &RouterState) -> StrategyVote {
        match self.matching_rule(request) {
            Some(rule) => StrategyVote::new(
                rule.outcome,
                rule.confidence,
                format!("rule '{}' matched", rule.name),
            ),
            None => StrategyVote::new(RoutingOutcome::Auto, 0.25, "no rule matched"),
        }
    }
}
