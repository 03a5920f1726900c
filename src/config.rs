//! Engine configuration.
//!
//! All tunables recognised by the engine live in [`EngineConfig`], with the
//! documented defaults in its `Default` impl. Components receive the whole
//! config at construction; nothing reads environment variables or files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default invoker fan-out cap.
pub const DEFAULT_MAX_CONCURRENT_EXPERTS: usize = 7;
/// Default per-expert timeout in milliseconds.
pub const DEFAULT_EXPERT_TIMEOUT_MS: u64 = 30_000;
/// Reserve subtracted from the request deadline to form the invoker budget.
pub const BUDGET_RESERVE_MS: u64 = 2_000;

/// Per-strategy weights used by the router's hybrid vote.
///
/// Weights must sum to 1 (validated by [`EngineConfig::validate`]).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategyWeights {
    pub rule: f64,
    pub history: f64,
    pub role: f64,
    pub learned: f64,
}

impl Default for StrategyWeights {
    fn default() -> Self {
        Self {
            rule: 0.3,
            history: 0.2,
            role: 0.2,
            learned: 0.3,
        }
    }
}

impl StrategyWeights {
    /// A rule-only weighting, useful as a reference behaviour in tests.
    pub fn rule_only() -> Self {
        Self {
            rule: 1.0,
            history: 0.0,
            role: 0.0,
            learned: 0.0,
        }
    }

    pub fn sum(&self) -> f64 {
        self.rule + self.history + self.role + self.learned
    }
}

/// Session timeout defaults per prompt kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanTimeouts {
    pub confirmation_ms: u64,
    pub selection_ms: u64,
    pub input_ms: u64,
    pub upload_ms: u64,
}

impl Default for HumanTimeouts {
    fn default() -> Self {
        Self {
            confirmation_ms: 120_000,
            selection_ms: 300_000,
            input_ms: 600_000,
            upload_ms: 900_000,
        }
    }
}

/// Retry policy shared by the expert invoker and the interaction client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retries for a single call.
    pub max_retries: u32,
    /// Base delay used for exponential backoff.
    pub base_delay_ms: u64,
    /// Backoff multiplier applied per retry attempt.
    pub backoff_factor: f64,
}

impl RetryConfig {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt as i32);
        let millis = (self.base_delay_ms as f64 * factor).round().max(0.0) as u64;
        Duration::from_millis(millis)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 200,
            backoff_factor: 2.0,
        }
    }
}

/// Configuration for the whole engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Invoker fan-out cap.
    pub max_concurrent_experts: usize,
    /// Per-expert timeout in milliseconds.
    pub expert_timeout_ms: u64,
    /// Session timeout defaults by prompt kind.
    pub human_timeouts: HumanTimeouts,
    /// Router strategy weights; must sum to 1.
    pub router_strategy_weights: StrategyWeights,
    /// Recommendations below this confidence are dropped by the aggregator.
    pub aggregator_conf_floor: f64,
    /// Dissent score above which the aggregator escalates to a human.
    pub aggregator_escalation_threshold: f64,
    /// Trainer cadence in seconds.
    pub optimizer_update_interval_s: u64,
    /// Retrain early once this many new observations have accumulated.
    pub optimizer_observation_threshold: usize,
    /// Observation retention window in days.
    pub optimizer_retention_days: u32,
    /// Maximum observations buffered before oldest are dropped.
    pub optimizer_buffer_size: usize,
    /// Holdout-reward margin below which a candidate model is rejected.
    pub optimizer_regression_margin: f64,
    /// Minimum base-expert match score before a dynamic expert is synthesised.
    pub dynamic_expert_capability_threshold: f64,
    /// Consecutive failures before an expert degrades.
    pub expert_degraded_failures: u32,
    /// Degrade cool-down in seconds.
    pub expert_degraded_cooldown_s: u64,
    /// Upper bound on experts consulted for a single request.
    pub max_experts: usize,
    /// Dynamic experts with zero calls in this window are pruned.
    pub expert_prune_window_s: u64,
    /// Pruner cadence in seconds.
    pub expert_prune_interval_s: u64,
    /// Outstanding human sessions allowed per requester.
    pub max_sessions_per_requester: usize,
    /// Default request deadline when the caller sets none.
    pub default_deadline_ms: u64,
    /// Whether a failed human loop may fall back to automatic handling.
    pub allow_auto_fallback: bool,
    /// Retry policy for backend and interaction-service calls.
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_experts: DEFAULT_MAX_CONCURRENT_EXPERTS,
            expert_timeout_ms: DEFAULT_EXPERT_TIMEOUT_MS,
            human_timeouts: HumanTimeouts::default(),
            router_strategy_weights: StrategyWeights::default(),
            aggregator_conf_floor: 0.2,
            aggregator_escalation_threshold: 0.7,
            optimizer_update_interval_s: 3_600,
            optimizer_observation_threshold: 500,
            optimizer_retention_days: 30,
            optimizer_buffer_size: 4_096,
            optimizer_regression_margin: 0.05,
            dynamic_expert_capability_threshold: 0.6,
            expert_degraded_failures: 3,
            expert_degraded_cooldown_s: 300,
            max_experts: 5,
            expert_prune_window_s: 86_400,
            expert_prune_interval_s: 3_600,
            max_sessions_per_requester: 4,
            default_deadline_ms: 120_000,
            allow_auto_fallback: false,
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent_experts(mut self, max: usize) -> Self {
        self.max_concurrent_experts = max;
        self
    }

    pub fn with_expert_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.expert_timeout_ms = timeout_ms;
        self
    }

    pub fn with_strategy_weights(mut self, weights: StrategyWeights) -> Self {
        self.router_strategy_weights = weights;
        self
    }

    pub fn with_conf_floor(mut self, floor: f64) -> Self {
        self.aggregator_conf_floor = floor;
        self
    }

    pub fn with_escalation_threshold(mut self, threshold: f64) -> Self {
        self.aggregator_escalation_threshold = threshold;
        self
    }

    pub fn with_default_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.default_deadline_ms = deadline_ms;
        self
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// The invoker's aggregate budget for a request with the given deadline.
    pub fn invoker_budget_ms(&self, deadline_ms: u64) -> u64 {
        deadline_ms.saturating_sub(BUDGET_RESERVE_MS).max(1)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_experts == 0 {
            return Err(Error::Config(
                "max_concurrent_experts must be at least 1".to_string(),
            ));
        }
        let sum = self.router_strategy_weights.sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(Error::Config(format!(
                "router_strategy_weights must sum to 1, got {sum}"
            )));
        }
        if !(0.0..=1.0).contains(&self.aggregator_conf_floor) {
            return Err(Error::Config(
                "aggregator_conf_floor must be in [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.aggregator_escalation_threshold) {
            return Err(Error::Config(
                "aggregator_escalation_threshold must be in [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.dynamic_expert_capability_threshold) {
            return Err(Error::Config(
                "dynamic_expert_capability_threshold must be in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}
