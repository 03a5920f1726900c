//! Expert population types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for an expert.
///
/// Base experts use their type name; dynamic experts use `dyn:<signature>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExpertId(pub String);

impl ExpertId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id for a dynamic expert keyed by scenario signature.
    pub fn dynamic(signature: &str) -> Self {
        Self(format!("dyn:{signature}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExpertId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Expert specialisation.
///
/// The seven base types are seeded at startup; dynamic experts carry the
/// scenario tag they were synthesised for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpertType {
    Technical,
    Api,
    Business,
    Data,
    Integration,
    Security,
    Performance,
    Dynamic(String),
}

impl ExpertType {
    /// All seven base types, in seeding order.
    pub fn base_types() -> [ExpertType; 7] {
        [
            Self::Technical,
            Self::Api,
            Self::Business,
            Self::Data,
            Self::Integration,
            Self::Security,
            Self::Performance,
        ]
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Self::Dynamic(_))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Technical => "technical",
            Self::Api => "api",
            Self::Business => "business",
            Self::Data => "data",
            Self::Integration => "integration",
            Self::Security => "security",
            Self::Performance => "performance",
            Self::Dynamic(tag) => tag,
        }
    }

    /// The capability profile a fresh expert of this type starts with.
    pub fn base_capabilities(&self) -> CapabilityVector {
        let mut caps = CapabilityVector::new();
        match self {
            Self::Technical => {
                caps.set("code_analysis", 0.9);
                caps.set("generation", 0.7);
                caps.set("review", 0.8);
                caps.set("debugging", 0.8);
            }
            Self::Api => {
                caps.set("api_design", 0.9);
                caps.set("integration", 0.6);
                caps.set("review", 0.5);
            }
            Self::Business => {
                caps.set("requirements", 0.9);
                caps.set("planning", 0.8);
                caps.set("review", 0.4);
            }
            Self::Data => {
                caps.set("data_modeling", 0.9);
                caps.set("migration", 0.7);
                caps.set("code_analysis", 0.5);
            }
            Self::Integration => {
                caps.set("integration", 0.9);
                caps.set("deployment", 0.7);
                caps.set("api_design", 0.5);
            }
            Self::Security => {
                caps.set("security", 0.95);
                caps.set("review", 0.7);
                caps.set("deployment", 0.5);
            }
            Self::Performance => {
                caps.set("performance", 0.95);
                caps.set("code_analysis", 0.6);
                caps.set("debugging", 0.6);
            }
            Self::Dynamic(_) => {}
        }
        caps
    }
}

/// Expert availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpertStatus {
    Idle,
    Busy,
    Degraded,
    Offline,
}

/// Mapping from capability name to a score in [0, 1].
///
/// Backed by a `BTreeMap` so iteration order (and therefore every derived
/// score and signature) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityVector(BTreeMap<String, f64>);

impl CapabilityVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, score: f64) {
        self.0.insert(name.into(), score.clamp(0.0, 1.0));
    }

    pub fn with(mut self, name: impl Into<String>, score: f64) -> Self {
        self.set(name, score);
        self
    }

    pub fn get(&self, name: &str) -> f64 {
        self.0.get(name).copied().unwrap_or(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Weighted average of this vector's scores over the needed axes.
    ///
    /// Returns a value in [0, 1]: 1.0 means full coverage of every need,
    /// 0.0 means no overlap. Empty needs score 0.
    pub fn match_score(&self, needs: &CapabilityVector) -> f64 {
        let total_weight: f64 = needs.0.values().sum();
        if total_weight <= 0.0 {
            return 0.0;
        }
        let dot: f64 = needs
            .0
            .iter()
            .map(|(name, weight)| weight * self.get(name))
            .sum();
        dot / total_weight
    }
}

impl FromIterator<(String, f64)> for CapabilityVector {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        let mut caps = Self::new();
        for (name, score) in iter {
            caps.set(name, score);
        }
        caps
    }
}

/// Rolling performance statistics for one expert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub calls: u64,
    pub successes: u64,
    pub consecutive_failures: u32,
    pub avg_latency_ms: f64,
    pub avg_confidence: f64,
}

impl PerformanceStats {
    /// Record a successful invocation, updating the rolling averages.
    pub fn record_success(&mut self, latency_ms: u64, confidence: f64) {
        self.calls += 1;
        self.successes += 1;
        self.consecutive_failures = 0;

        let n = self.successes as f64;
        self.avg_latency_ms = ((n - 1.0) * self.avg_latency_ms + latency_ms as f64) / n;
        self.avg_confidence = ((n - 1.0) * self.avg_confidence + confidence) / n;
    }

    /// Record a failed invocation.
    pub fn record_failure(&mut self) {
        self.calls += 1;
        self.consecutive_failures += 1;
    }

    /// Fraction of calls that succeeded. An expert with no calls yet scores
    /// a neutral 0.5, placing it at the unweighted baseline until it earns
    /// a track record.
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            0.5
        } else {
            self.successes as f64 / self.calls as f64
        }
    }
}

/// A typed analyzer in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expert {
    pub id: ExpertId,
    pub expert_type: ExpertType,
    pub capabilities: CapabilityVector,
    pub status: ExpertStatus,
    /// Set while degraded; the registry restores the expert to idle after it.
    pub degraded_until: Option<DateTime<Utc>>,
    pub stats: PerformanceStats,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Expert {
    /// Create a base expert of the given type.
    pub fn base(expert_type: ExpertType) -> Self {
        debug_assert!(!expert_type.is_dynamic());
        Self {
            id: ExpertId::new(expert_type.name()),
            capabilities: expert_type.base_capabilities(),
            expert_type,
            status: ExpertStatus::Idle,
            degraded_until: None,
            stats: PerformanceStats::default(),
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    /// Create a dynamic expert for a scenario signature.
    pub fn dynamic(signature: &str, capabilities: CapabilityVector) -> Self {
        Self {
            id: ExpertId::dynamic(signature),
            expert_type: ExpertType::Dynamic(signature.to_string()),
            capabilities,
            status: ExpertStatus::Idle,
            degraded_until: None,
            stats: PerformanceStats::default(),
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    /// Whether the registry's search may rank this expert.
    pub fn is_selectable(&self) -> bool {
        self.status == ExpertStatus::Idle
    }

    /// Whether the invoker may still call this expert. Busy experts queue;
    /// degraded and offline experts are off limits.
    pub fn is_invokable(&self) -> bool {
        matches!(self.status, ExpertStatus::Idle | ExpertStatus::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_base_types_cover_seven() {
        let types = ExpertType::base_types();
        assert_eq!(types.len(), 7);
        for t in &types {
            assert!(!t.is_dynamic());
            assert!(!t.base_capabilities().is_empty());
        }
    }

    #[test]
    fn test_dynamic_expert_id_shape() {
        let expert = Expert::dynamic("a1b2c3", CapabilityVector::new());
        assert_eq!(expert.id.as_str(), "dyn:a1b2c3");
        assert!(expert.expert_type.is_dynamic());
    }

    #[test]
    fn test_match_score_bounds() {
        let expert = Expert::base(ExpertType::Security);
        let needs = CapabilityVector::new().with("security", 1.0);
        let score = expert.capabilities.match_score(&needs);
        assert!(score > 0.9 && score <= 1.0);

        let unrelated = CapabilityVector::new().with("data_modeling", 1.0);
        assert_eq!(expert.capabilities.match_score(&unrelated), 0.0);

        // Empty needs never match anything.
        assert_eq!(
            expert.capabilities.match_score(&CapabilityVector::new()),
            0.0
        );
    }

    #[test]
    fn test_match_score_weighting() {
        let caps = CapabilityVector::new()
            .with("security", 1.0)
            .with("review", 0.5);
        let needs = CapabilityVector::new()
            .with("security", 0.8)
            .with("review", 0.2);
        // (0.8 * 1.0 + 0.2 * 0.5) / 1.0 = 0.9
        let score = caps.match_score(&needs);
        assert!((score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_rolling_stats() {
        let mut stats = PerformanceStats::default();
        // No calls yet: neutral, not perfect.
        assert_eq!(stats.success_rate(), 0.5);

        stats.record_success(100, 0.8);
        stats.record_success(200, 0.6);
        stats.record_failure();

        assert_eq!(stats.calls, 3);
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.consecutive_failures, 1);
        assert!((stats.avg_latency_ms - 150.0).abs() < 0.1);
        assert!((stats.avg_confidence - 0.7).abs() < 1e-9);
        assert!((stats.success_rate() - 2.0 / 3.0).abs() < 1e-9);

        stats.record_success(100, 0.9);
        assert_eq!(stats.consecutive_failures, 0);
    }

    #[test]
    fn test_capability_scores_clamped() {
        let caps = CapabilityVector::new().with("x", 2.0).with("y", -1.0);
        assert_eq!(caps.get("x"), 1.0);
        assert_eq!(caps.get("y"), 0.0);
    }
}
