//! Routing strategies.
//!
//! Each strategy is a pure function from a request and the shared router
//! state to a candidate vote. Abstention is expressed as a zero-confidence
//! vote, which contributes nothing to the hybrid combination.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::optimizer::{RoutingObservation, ScoringModel};
use crate::request::{Request, RequesterRole};
use crate::router::types::{FeatureVector, RoutingOutcome, StrategyVote};

/// State shared by all strategies for one decision.
///
/// Assembled once per `decide` call so every strategy sees the same frozen
/// view and the decision is reproducible.
#[derive(Clone)]
pub struct RouterState {
    pub recent_observations: Vec<RoutingObservation>,
    pub model: Arc<ScoringModel>,
}

impl Default for RouterState {
    fn default() -> Self {
        Self {
            recent_observations: Vec::new(),
            model: Arc::new(ScoringModel::untrained()),
        }
    }
}

/// A candidate-producing routing signal.
pub trait RoutingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&self, request: &Request, state: &RouterState) -> StrategyVote;
}

/// Nearest-neighbour vote over recent routing observations.
pub struct HistoryStrategy {
    k: usize,
}

impl HistoryStrategy {
    pub fn new(k: usize) -> Self {
        Self { k: k.max(1) }
    }
}

impl Default for HistoryStrategy {
    fn default() -> Self {
        Self::new(5)
    }
}

impl RoutingStrategy for HistoryStrategy {
    fn name(&self) -> &'static str {
        "history"
    }

    fn evaluate(&self, request: &Request, state: &RouterState) -> StrategyVote {
        if state.recent_observations.is_empty() {
            return StrategyVote::new(RoutingOutcome::Auto, 0.0, "no routing history");
        }

        let features = FeatureVector::from_request(request);
        let mut ranked: Vec<(f64, &RoutingObservation)> = state
            .recent_observations
            .iter()
            .map(|obs| (features.distance(&obs.features), obs))
            .collect();
        // Stable sort keeps submission order among equidistant neighbours.
        ranked.sort_by(|(a, _), (b, _)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let neighbours: Vec<&RoutingObservation> =
            ranked.iter().take(self.k).map(|(_, obs)| *obs).collect();
        let mut counts: BTreeMap<&str, (RoutingOutcome, usize)> = BTreeMap::new();
        for obs in &neighbours {
            counts
                .entry(obs.decision.as_str())
                .or_insert((obs.decision, 0))
                .1 += 1;
        }
        // BTreeMap iteration is name-ordered; keeping the first maximum
        // breaks equal counts toward the lexicographically smaller outcome.
        let mut best: Option<(RoutingOutcome, usize)> = None;
        for &(outcome, count) in counts.values() {
            if best.map_or(true, |(_, top)| count > top) {
                best = Some((outcome, count));
            }
        }
        let (outcome, votes) = best.expect("at least one neighbour");

        let confidence = votes as f64 / neighbours.len() as f64;
        StrategyVote::new(
            outcome,
            confidence,
            format!(
                "{votes}/{} nearest observations chose {outcome}",
                neighbours.len()
            ),
        )
    }
}

/// Role-based gate: destructive actions by non-admins want a human.
pub struct RoleStrategy;

impl RoutingStrategy for RoleStrategy {
    fn name(&self) -> &'static str {
        "role"
    }

    fn evaluate(&self, request: &Request, _state: &RouterState) -> StrategyVote {
        let role = request.metadata.requester_role;
        if request.kind.is_destructive() {
            if role == RequesterRole::Admin {
                StrategyVote::new(
                    RoutingOutcome::Auto,
                    0.5,
                    "destructive action by an admin",
                )
            } else {
                StrategyVote::new(
                    RoutingOutcome::HumanRequired,
                    0.85,
                    format!("destructive {} by non-admin", request.kind.as_str()),
                )
            }
        } else {
            StrategyVote::new(RoutingOutcome::Auto, 0.5, "non-destructive request")
        }
    }
}

/// Vote from the optimizer-trained scorer.
pub struct LearnedStrategy;

impl RoutingStrategy for LearnedStrategy {
    fn name(&self) -> &'static str {
        "learned"
    }

    fn evaluate(&self, request: &Request, state: &RouterState) -> StrategyVote {
        if !state.model.is_trained() {
            return StrategyVote::new(RoutingOutcome::Auto, 0.0, "model not yet trained");
        }

        let features = FeatureVector::from_request(request);
        let (outcome, probability) = state.model.best_outcome(&features);
        StrategyVote::new(
            outcome,
            probability,
            format!(
                "model v{} scored {outcome} at {probability:.2}",
                state.model.version
            ),
        )
    }
}
