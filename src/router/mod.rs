//! Dynamic router: one weighted decision per request.
//!
//! Four strategies (rule, history, role, learned) each produce a candidate
//! vote; the hybrid combiner weighs them, picks the winning outcome, and
//! reports the margin over the runner-up as the decision confidence. Given
//! identical strategy state and an identical request, the decision is
//! identical; ties break in lexicographic outcome-name order.

pub mod rules;
pub mod strategies;
pub mod templates;
pub mod types;

use serde_json::json;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::config::{EngineConfig, StrategyWeights};
use crate::optimizer::Optimizer;
use crate::registry::{capability_needs, ExpertRegistry, ScenarioSignature};
use crate::request::Request;

pub use rules::{default_rules, RoutingRule, RulePredicate, RuleStrategy};
pub use strategies::{
    HistoryStrategy, LearnedStrategy, RoleStrategy, RouterState, RoutingStrategy,
};
pub use types::{
    Condition, ConditionalPolicy, FeatureVector, RoutingDecision, RoutingOutcome, StrategyVote,
};

/// How many recent observations the history strategy sees.
const HISTORY_WINDOW: usize = 64;

/// Emits a [`RoutingDecision`] for every request.
pub struct Router {
    rule: RuleStrategy,
    history: HistoryStrategy,
    role: RoleStrategy,
    learned: LearnedStrategy,
    weights: StrategyWeights,
    max_experts: usize,
    registry: Arc<ExpertRegistry>,
    optimizer: Arc<Optimizer>,
}

impl Router {
    pub fn new(
        registry: Arc<ExpertRegistry>,
        optimizer: Arc<Optimizer>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            rule: RuleStrategy::default(),
            history: HistoryStrategy::default(),
            role: RoleStrategy,
            learned: LearnedStrategy,
            weights: config.router_strategy_weights,
            max_experts: config.max_experts.max(1),
            registry,
            optimizer,
        }
    }

    /// Replace the rule set.
    pub fn with_rules(mut self, rules: Vec<RoutingRule>) -> Self {
        self.rule = RuleStrategy::new(rules);
        self
    }

    /// Experts consulted for a request: grows with complexity, capped by
    /// configuration.
    fn expert_count(&self, request: &Request) -> usize {
        let scaled = 1 + (request.metadata.complexity * 4.0).ceil() as usize;
        scaled.min(self.max_experts)
    }

    /// Decide how to service a request. Infallible: strategy abstentions and
    /// registry hiccups degrade the decision, they never abort it.
    #[instrument(skip_all, fields(request_id = %request.id))]
    pub async fn decide(&self, request: &Request) -> RoutingDecision {
        let state = RouterState {
            recent_observations: self.optimizer.recent(HISTORY_WINDOW),
            model: self.optimizer.current_model(),
        };

        let votes = [
            (self.weights.rule, self.rule.evaluate(request, &state)),
            (self.weights.history, self.history.evaluate(request, &state)),
            (self.weights.role, self.role.evaluate(request, &state)),
            (self.weights.learned, self.learned.evaluate(request, &state)),
        ];

        // Weighted score per outcome; all() is lexicographic name order, and
        // keeping the first maximum makes that the tie-break.
        let mut winner = (RoutingOutcome::Auto, 0.0_f64);
        let mut runner_up = (RoutingOutcome::Auto, -1.0_f64);
        for outcome in RoutingOutcome::all() {
            let score: f64 = votes
                .iter()
                .filter(|(_, vote)| vote.outcome == outcome)
                .map(|(weight, vote)| weight * vote.confidence)
                .sum();
            if score > winner.1 {
                runner_up = winner;
                winner = (outcome, score);
            } else if score > runner_up.1 {
                runner_up = (outcome, score);
            }
        }
        let (outcome, winner_score) = winner;
        let (mut fallback, runner_up_score) = runner_up;
        if runner_up_score <= 0.0 {
            // Nothing else scored; fall back to the mildest distinct outcome.
            fallback = if outcome == RoutingOutcome::Auto {
                RoutingOutcome::ExpertConsultation
            } else {
                RoutingOutcome::Auto
            };
        }

        let confidence = if winner_score > 0.0 {
            ((winner_score - runner_up_score.max(0.0)) / winner_score).clamp(0.0, 1.0)
        } else {
            0.1
        };

        let rationale = votes
            .iter()
            .filter(|(weight, vote)| vote.outcome == outcome && *weight * vote.confidence > 0.0)
            .map(|(_, vote)| vote.rationale.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        let rationale = if rationale.is_empty() {
            "no strategy produced a scored vote".to_string()
        } else {
            rationale
        };

        debug!(outcome = %outcome, confidence, "routing decision");

        let mut decision = RoutingDecision {
            request_id: request.id.to_string(),
            outcome,
            confidence,
            rationale: rationale.clone(),
            selected_experts: Vec::new(),
            human_prompt: None,
            conditional: None,
            fallback_outcome: fallback,
            auto_recommendation: None,
        };

        match outcome {
            RoutingOutcome::Auto => {
                decision.auto_recommendation = Some(json!({
                    "action": "proceed",
                    "rationale": rationale,
                }));
            }
            RoutingOutcome::ExpertConsultation => {
                decision.selected_experts = self.select_experts(request).await;
            }
            RoutingOutcome::HumanRequired => {
                decision.human_prompt = Some(templates::prompt_for(request));
            }
            RoutingOutcome::Conditional => {
                // Precompute both branches so dispatch never has to come
                // back to the router.
                decision.conditional = Some(self.conditional_policy(request));
                decision.human_prompt = Some(templates::prompt_for(request));
                decision.selected_experts = self.select_experts(request).await;
                decision.auto_recommendation = Some(json!({
                    "action": "proceed",
                    "rationale": rationale,
                }));
            }
        }

        decision
    }

    async fn select_experts(&self, request: &Request) -> Vec<crate::registry::ExpertId> {
        let needs = capability_needs(request);
        let signature = ScenarioSignature::from_request(request);
        let k = self.expert_count(request);
        match self
            .registry
            .select_for_scenario(&signature, &needs, k)
            .await
        {
            Ok(experts) => experts.into_iter().map(|e| e.id).collect(),
            Err(e) => {
                warn!(error = %e, "expert selection failed");
                Vec::new()
            }
        }
    }

    /// The policy a CONDITIONAL decision branches on: the matched rule's, if
    /// it declared one, otherwise complexity-gated consultation.
    fn conditional_policy(&self, request: &Request) -> ConditionalPolicy {
        self.rule
            .matching_rule(request)
            .and_then(|rule| rule.policy)
            .unwrap_or(ConditionalPolicy {
                condition: Condition::ComplexityAbove(0.5),
                when_true: RoutingOutcome::ExpertConsultation,
                when_false: RoutingOutcome::Auto,
            })
    }
}
