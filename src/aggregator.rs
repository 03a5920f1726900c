//! Confidence-weighted merging of expert recommendations and human input.
//!
//! The aggregator never fails: with nothing usable to merge it falls back to
//! the router's own recommendation (AUTO path) or a low-confidence result
//! carrying the routing rationale.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::EngineConfig;
use crate::human::HumanResponse;
use crate::invoker::ExpertRecommendation;
use crate::registry::{ExpertId, ExpertRegistry};
use crate::router::types::RoutingDecision;

/// Confidence reported when nothing contributed to the result.
const FLOOR_CONFIDENCE: f64 = 0.1;

/// Confidence attributed to an explicit human answer.
const HUMAN_CONFIDENCE: f64 = 0.95;

/// The engine's final answer for a request.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AggregatedResult {
    pub request_id: String,
    pub recommendation: Value,
    pub confidence: f64,
    pub contributing_experts: Vec<ExpertId>,
    /// Normalised spread of the contributing confidences, in [0, 1].
    pub dissent_score: f64,
    pub human_input: Option<Value>,
}

/// Merges recommendations into one [`AggregatedResult`].
pub struct Aggregator {
    conf_floor: f64,
    escalation_threshold: f64,
    /// Multiplier a human answer gets over a single expert.
    human_weight: f64,
    registry: Arc<ExpertRegistry>,
}

impl Aggregator {
    pub fn new(registry: Arc<ExpertRegistry>, config: &EngineConfig) -> Self {
        Self {
            conf_floor: config.aggregator_conf_floor,
            escalation_threshold: config.aggregator_escalation_threshold,
            human_weight: 3.0,
            registry,
        }
    }

    /// Weight of one expert's contribution, derived from its rolling success
    /// rate and bounded so one expert can never run away with the merge.
    /// An unproven expert (no calls, or no registry record) sits at the
    /// neutral rate 0.5 and therefore the unweighted baseline of 1.0.
    fn expert_weight(&self, id: &ExpertId) -> f64 {
        let rate = self
            .registry
            .get(id)
            .ok()
            .flatten()
            .map(|expert| expert.stats.success_rate())
            .unwrap_or(0.5);
        (rate * 2.0).clamp(0.5, 2.0)
    }

    /// Spread of the contributing confidences: twice the mean absolute
    /// pairwise difference, clamped to [0, 1]. Zero below two contributors.
    fn dissent_score(confidences: &[f64]) -> f64 {
        if confidences.len() < 2 {
            return 0.0;
        }
        let mut total = 0.0;
        let mut pairs = 0u32;
        for (i, a) in confidences.iter().enumerate() {
            for b in &confidences[i + 1..] {
                total += (a - b).abs();
                pairs += 1;
            }
        }
        (2.0 * total / pairs as f64).clamp(0.0, 1.0)
    }

    /// Whether the merged result warrants asking a human.
    ///
    /// Only meaningful on the consultation path; with a threshold of zero
    /// every consultation escalates.
    pub fn should_escalate(&self, result: &AggregatedResult) -> bool {
        result.human_input.is_none() && result.dissent_score >= self.escalation_threshold
    }

    /// Merge expert recommendations and optional human input.
    pub fn merge(
        &self,
        recommendations: &[ExpertRecommendation],
        human: Option<&HumanResponse>,
        decision: &RoutingDecision,
    ) -> AggregatedResult {
        // Errors and low-confidence output never contribute.
        let kept: Vec<&ExpertRecommendation> = recommendations
            .iter()
            .filter(|rec| !rec.is_error() && rec.confidence >= self.conf_floor)
            .collect();

        let confidences: Vec<f64> = kept.iter().map(|rec| rec.confidence).collect();
        let dissent_score = Self::dissent_score(&confidences);

        if kept.is_empty() && human.is_none() {
            return self.fallback_result(decision, dissent_score);
        }

        // Group identical outputs; each contributes expert_weight × confidence.
        // Keys are canonical JSON, so grouping and tie-breaks are stable.
        let mut groups: BTreeMap<String, (Value, f64)> = BTreeMap::new();
        let mut weight_sum = 0.0;
        let mut weighted_confidence = 0.0;
        for rec in &kept {
            let weight = self.expert_weight(&rec.expert_id);
            let key = rec.output.to_string();
            let entry = groups.entry(key).or_insert((rec.output.clone(), 0.0));
            entry.1 += weight * rec.confidence;
            weight_sum += weight;
            weighted_confidence += weight * rec.confidence;
        }

        // First maximum in key order: deterministic under reordering.
        let mut winner: Option<(&Value, f64)> = None;
        for (value, score) in groups.values() {
            if winner.map_or(true, |(_, top)| *score > top) {
                winner = Some((value, *score));
            }
        }
        let mut recommendation = winner
            .map(|(value, _)| value.clone())
            .unwrap_or(Value::Null);

        let mut human_input = None;
        if let Some(response) = human {
            recommendation = overlay_human(recommendation, &response.value);
            weighted_confidence += self.human_weight * HUMAN_CONFIDENCE;
            weight_sum += self.human_weight;
            human_input = Some(response.value.clone());
        }

        let confidence = if weight_sum > 0.0 {
            (weighted_confidence / weight_sum).clamp(0.0, 1.0)
        } else {
            FLOOR_CONFIDENCE
        };

        debug!(
            request_id = %decision.request_id,
            contributing = kept.len(),
            dissent = dissent_score,
            confidence,
            "merged recommendations"
        );

        AggregatedResult {
            request_id: decision.request_id.clone(),
            recommendation,
            confidence,
            contributing_experts: kept.iter().map(|rec| rec.expert_id.clone()).collect(),
            dissent_score,
            human_input,
        }
    }

    /// Nothing contributed: fall back to what the router supplied.
    fn fallback_result(&self, decision: &RoutingDecision, dissent_score: f64) -> AggregatedResult {
        match &decision.auto_recommendation {
            Some(auto) => AggregatedResult {
                request_id: decision.request_id.clone(),
                recommendation: auto.clone(),
                confidence: decision.confidence.clamp(0.0, 1.0),
                contributing_experts: Vec::new(),
                dissent_score,
                human_input: None,
            },
            None => AggregatedResult {
                request_id: decision.request_id.clone(),
                recommendation: Value::String(decision.rationale.clone()),
                confidence: FLOOR_CONFIDENCE,
                contributing_experts: Vec::new(),
                dissent_score,
                human_input: None,
            },
        }
    }
}

/// Human input overrides the fields it explicitly addresses; everything else
/// keeps the expert consensus.
fn overlay_human(base: Value, human: &Value) -> Value {
    match (base, human) {
        (Value::Object(mut merged), Value::Object(overrides)) => {
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (_, other) => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::types::{RoutingOutcome, RoutingDecision};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn aggregator() -> Aggregator {
        let config = EngineConfig::default();
        Aggregator::new(Arc::new(ExpertRegistry::new(&config)), &config)
    }

    fn decision(outcome: RoutingOutcome) -> RoutingDecision {
        RoutingDecision {
            request_id: "req-1".into(),
            outcome,
            confidence: 0.9,
            rationale: "rule 'dev-low-risk-auto' matched".into(),
            selected_experts: Vec::new(),
            human_prompt: None,
            conditional: None,
            fallback_outcome: RoutingOutcome::Auto,
            auto_recommendation: match outcome {
                RoutingOutcome::Auto => Some(json!({"action": "proceed"})),
                _ => None,
            },
        }
    }

    fn rec(id: &str, output: Value, confidence: f64) -> ExpertRecommendation {
        ExpertRecommendation {
            expert_id: ExpertId::new(id),
            output,
            confidence,
            latency_ms: 10,
            error: None,
        }
    }

    fn human(value: Value) -> HumanResponse {
        HumanResponse {
            session_id: crate::human::SessionId::new(),
            value,
            answered_at: Utc::now(),
        }
    }

    #[test]
    fn test_auto_path_uses_router_recommendation() {
        let aggregator = aggregator();
        let result = aggregator.merge(&[], None, &decision(RoutingOutcome::Auto));
        assert_eq!(result.recommendation, json!({"action": "proceed"}));
        assert!(result.confidence >= 0.5);
        assert!(result.contributing_experts.is_empty());
    }

    #[test]
    fn test_all_filtered_returns_rationale_never_fails() {
        let aggregator = aggregator();
        let recs = vec![
            rec("technical", json!({"verdict": "a"}), 0.1),
            rec("security", json!({"verdict": "b"}), 0.05),
        ];
        let result = aggregator.merge(&recs, None, &decision(RoutingOutcome::ExpertConsultation));
        assert_eq!(
            result.recommendation,
            Value::String("rule 'dev-low-risk-auto' matched".into())
        );
        assert!(result.confidence < 0.2);
        assert!(result.contributing_experts.is_empty());
    }

    #[test]
    fn test_errors_dropped() {
        let aggregator = aggregator();
        let recs = vec![
            rec("technical", json!({"verdict": "ok"}), 0.9),
            ExpertRecommendation::failure(ExpertId::new("security"), "timeout", 30_000),
        ];
        let result = aggregator.merge(&recs, None, &decision(RoutingOutcome::ExpertConsultation));
        assert_eq!(result.contributing_experts, vec![ExpertId::new("technical")]);
        assert!((result.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_heavier_group_wins() {
        let aggregator = aggregator();
        let recs = vec![
            rec("technical", json!({"verdict": "approve"}), 0.9),
            rec("api", json!({"verdict": "approve"}), 0.85),
            rec("security", json!({"verdict": "block"}), 0.3),
            rec("data", json!({"verdict": "block"}), 0.25),
        ];
        let result = aggregator.merge(&recs, None, &decision(RoutingOutcome::ExpertConsultation));
        assert_eq!(result.recommendation, json!({"verdict": "approve"}));
        assert_eq!(result.contributing_experts.len(), 4);
    }

    #[test]
    fn test_dissent_score_for_split_panel() {
        // Two camps far apart: high dissent, above the default threshold.
        let aggregator = aggregator();
        let recs = vec![
            rec("technical", json!({"verdict": "approve"}), 0.9),
            rec("api", json!({"verdict": "approve"}), 0.85),
            rec("security", json!({"verdict": "block"}), 0.3),
            rec("data", json!({"verdict": "block"}), 0.25),
        ];
        let result = aggregator.merge(&recs, None, &decision(RoutingOutcome::ExpertConsultation));
        assert!((result.dissent_score - 0.83).abs() < 0.05);
        assert!(aggregator.should_escalate(&result));
    }

    #[test]
    fn test_agreeing_panel_has_low_dissent() {
        let aggregator = aggregator();
        let recs = vec![
            rec("technical", json!({"verdict": "ok"}), 0.85),
            rec("security", json!({"verdict": "ok"}), 0.8),
        ];
        let result = aggregator.merge(&recs, None, &decision(RoutingOutcome::ExpertConsultation));
        assert!(result.dissent_score < 0.2);
        assert!(!aggregator.should_escalate(&result));
    }

    #[test]
    fn test_zero_threshold_escalates_everything() {
        let config = EngineConfig::default().with_escalation_threshold(0.0);
        let aggregator = Aggregator::new(Arc::new(ExpertRegistry::new(&config)), &config);
        let recs = vec![rec("technical", json!({"verdict": "ok"}), 0.9)];
        let result = aggregator.merge(&recs, None, &decision(RoutingOutcome::ExpertConsultation));
        assert_eq!(result.dissent_score, 0.0);
        assert!(aggregator.should_escalate(&result));
    }

    #[test]
    fn test_human_overrides_addressed_fields() {
        let aggregator = aggregator();
        let recs = vec![
            rec("technical", json!({"verdict": "approve", "notes": "lgtm"}), 0.9),
        ];
        let result = aggregator.merge(
            &recs,
            Some(&human(json!({"verdict": "block"}))),
            &decision(RoutingOutcome::ExpertConsultation),
        );
        // The addressed field flips, the untouched one survives.
        assert_eq!(
            result.recommendation,
            json!({"verdict": "block", "notes": "lgtm"})
        );
        assert_eq!(result.human_input, Some(json!({"verdict": "block"})));
        assert!(!aggregator.should_escalate(&result));
    }

    #[test]
    fn test_human_only_result_is_confident() {
        let aggregator = aggregator();
        let result = aggregator.merge(
            &[],
            Some(&human(json!({"choice": "confirm"}))),
            &decision(RoutingOutcome::HumanRequired),
        );
        assert_eq!(result.recommendation, json!({"choice": "confirm"}));
        assert!(result.confidence >= 0.8);
        assert_eq!(result.human_input, Some(json!({"choice": "confirm"})));
    }

    #[tokio::test]
    async fn test_proven_expert_outweighs_unproven() {
        let config = EngineConfig::default();
        let registry = Arc::new(ExpertRegistry::new(&config));
        let aggregator = Aggregator::new(Arc::clone(&registry), &config);

        // Build a track record: technical always succeeds, data mostly fails,
        // api has never been called.
        let technical = ExpertId::new("technical");
        for _ in 0..4 {
            registry.mark_busy(&technical).await.unwrap();
            registry.record_success(&technical, 10, 0.9).await.unwrap();
        }
        let data = ExpertId::new("data");
        registry.mark_busy(&data).await.unwrap();
        registry.record_success(&data, 10, 0.4).await.unwrap();
        registry.record_failure(&data).await.unwrap();
        registry.record_failure(&data).await.unwrap();

        assert_eq!(aggregator.expert_weight(&technical), 2.0);
        assert_eq!(aggregator.expert_weight(&ExpertId::new("api")), 1.0);
        assert!(aggregator.expert_weight(&data) < 1.0);

        // Equal confidences on both sides: only the track record separates
        // the single proven expert from the unproven pair.
        let recs = vec![
            rec("technical", json!({"verdict": "approve"}), 0.6),
            rec("data", json!({"verdict": "block"}), 0.6),
            rec("api", json!({"verdict": "block"}), 0.6),
        ];
        let result = aggregator.merge(&recs, None, &decision(RoutingOutcome::ExpertConsultation));
        assert_eq!(result.recommendation, json!({"verdict": "approve"}));
    }

    #[test]
    fn test_human_outweighs_experts() {
        let aggregator = aggregator();
        let recs = vec![
            rec("technical", json!({"verdict": "approve"}), 0.9),
            rec("api", json!({"verdict": "approve"}), 0.9),
        ];
        let result = aggregator.merge(
            &recs,
            Some(&human(json!({"verdict": "block"}))),
            &decision(RoutingOutcome::ExpertConsultation),
        );
        assert_eq!(result.recommendation["verdict"], json!("block"));
    }

    proptest! {
        #[test]
        fn prop_confidence_always_in_unit_interval(
            confidences in proptest::collection::vec(0.0f64..=1.0, 0..6),
            with_human in any::<bool>(),
        ) {
            let aggregator = aggregator();
            let recs: Vec<ExpertRecommendation> = confidences
                .iter()
                .enumerate()
                .map(|(i, c)| rec(&format!("expert-{i}"), json!({"verdict": i % 2}), *c))
                .collect();
            let human_response = human(json!({"verdict": "human"}));
            let human_ref = if with_human { Some(&human_response) } else { None };

            let result = aggregator.merge(&recs, human_ref, &decision(RoutingOutcome::ExpertConsultation));
            prop_assert!((0.0..=1.0).contains(&result.confidence));
            prop_assert!((0.0..=1.0).contains(&result.dissent_score));
        }

        #[test]
        fn prop_merge_is_order_independent(
            confidences in proptest::collection::vec(0.2f64..=1.0, 2..6),
        ) {
            let aggregator = aggregator();
            let recs: Vec<ExpertRecommendation> = confidences
                .iter()
                .enumerate()
                .map(|(i, c)| rec(&format!("expert-{i}"), json!({"verdict": i % 2}), *c))
                .collect();
            let mut reversed = recs.clone();
            reversed.reverse();

            let a = aggregator.merge(&recs, None, &decision(RoutingOutcome::ExpertConsultation));
            let b = aggregator.merge(&reversed, None, &decision(RoutingOutcome::ExpertConsultation));
            prop_assert_eq!(a.recommendation, b.recommendation);
            prop_assert!((a.confidence - b.confidence).abs() < 1e-9);
            prop_assert!((a.dissent_score - b.dissent_score).abs() < 1e-9);
        }
    }
}
