//! Public façade: `process(request) → AggregatedResult`.
//!
//! The pipeline is strictly sequential per call: validate, decide, dispatch
//! on the decision outcome, merge, record. Calls are independent and may run
//! concurrently; cancellation and the request deadline propagate cooperatively
//! through a child token, and the orchestrator never delivers a partial
//! result.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::aggregator::{AggregatedResult, Aggregator};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::human::{HumanLoopAdapter, HumanOutcome, InteractionClient, InMemoryInteractionClient};
use crate::invoker::{ExpertBackend, ExpertInvoker};
use crate::optimizer::{reward, Optimizer, ObservationStore, RoutingObservation, SqliteObservationStore};
use crate::registry::{Expert, ExpertRegistry};
use crate::request::Request;
use crate::router::types::FeatureVector;
use crate::router::{templates, Router, RoutingDecision, RoutingOutcome, RoutingRule};

/// Background maintenance tasks (expert pruner, model trainer).
pub struct Maintenance {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Maintenance {
    /// Stop the tasks and wait for them to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Builder for [`Orchestrator`].
///
/// An expert backend is required; the interaction client defaults to the
/// in-memory double and the observation store to an in-memory database,
/// which is what tests and local development want.
pub struct OrchestratorBuilder {
    config: EngineConfig,
    backend: Option<Arc<dyn ExpertBackend>>,
    interaction: Option<Arc<dyn InteractionClient>>,
    store: Option<Arc<dyn ObservationStore>>,
    rules: Option<Vec<RoutingRule>>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            backend: None,
            interaction: None,
            store: None,
            rules: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn ExpertBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_interaction_client(mut self, client: Arc<dyn InteractionClient>) -> Self {
        self.interaction = Some(client);
        self
    }

    pub fn with_observation_store(mut self, store: Arc<dyn ObservationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_rules(mut self, rules: Vec<RoutingRule>) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;
        let backend = self
            .backend
            .ok_or_else(|| Error::Config("an expert backend is required".to_string()))?;
        let interaction = self
            .interaction
            .unwrap_or_else(|| Arc::new(InMemoryInteractionClient::new()));
        let store: Arc<dyn ObservationStore> = match self.store {
            Some(store) => store,
            None => Arc::new(SqliteObservationStore::in_memory()?),
        };

        let registry = Arc::new(ExpertRegistry::new(&self.config));
        let optimizer = Arc::new(Optimizer::new(store, &self.config)?);
        let mut router = Router::new(Arc::clone(&registry), Arc::clone(&optimizer), &self.config);
        if let Some(rules) = self.rules {
            router = router.with_rules(rules);
        }

        Ok(Orchestrator {
            invoker: ExpertInvoker::new(backend, Arc::clone(&registry), &self.config),
            aggregator: Aggregator::new(Arc::clone(&registry), &self.config),
            human: HumanLoopAdapter::new(interaction, self.config.clone()),
            router,
            registry,
            optimizer,
            config: self.config,
        })
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The engine entry point.
pub struct Orchestrator {
    config: EngineConfig,
    registry: Arc<ExpertRegistry>,
    optimizer: Arc<Optimizer>,
    router: Router,
    invoker: ExpertInvoker,
    aggregator: Aggregator,
    human: HumanLoopAdapter,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn registry(&self) -> Arc<ExpertRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn optimizer(&self) -> Arc<Optimizer> {
        Arc::clone(&self.optimizer)
    }

    /// Start the expert pruner and the model trainer.
    pub fn start_maintenance(&self) -> Maintenance {
        let token = CancellationToken::new();
        let pruner = self.registry.spawn_pruner(
            Duration::from_secs(self.config.expert_prune_interval_s),
            Duration::from_secs(self.config.expert_prune_window_s),
            token.clone(),
        );
        let trainer = self.optimizer.spawn_trainer(&self.config, token.clone());
        Maintenance {
            token,
            handles: vec![pruner, trainer],
        }
    }

    /// Process one request to exactly one result or one error.
    pub async fn process(&self, request: Request) -> Result<AggregatedResult> {
        self.process_with_token(request, CancellationToken::new())
            .await
    }

    /// Like [`process`](Self::process), with caller-controlled cancellation.
    #[instrument(skip_all, fields(request_id = %request.id, kind = ?request.kind))]
    pub async fn process_with_token(
        &self,
        request: Request,
        token: CancellationToken,
    ) -> Result<AggregatedResult> {
        request.validate()?;
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let deadline_ms = request.deadline_ms.unwrap_or(self.config.default_deadline_ms);

        // The child token lets the deadline and the caller cancel in-flight
        // work; the pipeline then unwinds cooperatively, so no partial
        // result can escape.
        let call_token = token.child_token();
        let mut timed_out = false;
        let mut cancelled = false;

        let deadline = tokio::time::sleep(Duration::from_millis(deadline_ms));
        tokio::pin!(deadline);
        let pipeline = self.pipeline(&request, deadline_ms, &call_token);
        tokio::pin!(pipeline);

        let outcome = loop {
            tokio::select! {
                result = &mut pipeline => break result,
                _ = &mut deadline, if !timed_out && !cancelled => {
                    timed_out = true;
                    call_token.cancel();
                }
                _ = token.cancelled(), if !timed_out && !cancelled => {
                    cancelled = true;
                    call_token.cancel();
                }
            }
        };

        if cancelled {
            return Err(Error::Cancelled);
        }
        if timed_out {
            return Err(Error::timeout(deadline_ms));
        }
        outcome
    }

    /// Decide, dispatch, merge, record.
    async fn pipeline(
        &self,
        request: &Request,
        deadline_ms: u64,
        token: &CancellationToken,
    ) -> Result<AggregatedResult> {
        let started = Instant::now();
        let decision = self.router.decide(request).await;
        info!(
            outcome = %decision.outcome,
            confidence = decision.confidence,
            "routing decision"
        );

        let primary = self
            .dispatch(request, &decision, decision.outcome, deadline_ms, token)
            .await;

        let result = match primary {
            Ok(result) => result,
            Err(e) if self.fallback_applies(&e, &decision) => {
                warn!(
                    error = %e,
                    fallback = %decision.fallback_outcome,
                    "primary path failed, taking fallback outcome"
                );
                self.dispatch(request, &decision, decision.fallback_outcome, deadline_ms, token)
                    .await?
            }
            Err(e) => return Err(e),
        };

        self.record(request, &decision, &result, started, deadline_ms);
        Ok(result)
    }

    /// Whether a primary-path failure may retry on the fallback outcome.
    ///
    /// A failed consultation falls back only to a human; a failed human loop
    /// falls back only when policy allows automatic handling. Timeouts,
    /// cancellation, and validation failures always surface.
    fn fallback_applies(&self, error: &Error, decision: &RoutingDecision) -> bool {
        match error {
            Error::NoExpertsAvailable { .. } => {
                decision.fallback_outcome == RoutingOutcome::HumanRequired
            }
            Error::HumanLoopUnavailable { .. } => {
                self.config.allow_auto_fallback
                    && decision.fallback_outcome != RoutingOutcome::HumanRequired
            }
            _ => false,
        }
    }

    fn dispatch<'a>(
        &'a self,
        request: &'a Request,
        decision: &'a RoutingDecision,
        outcome: RoutingOutcome,
        deadline_ms: u64,
        token: &'a CancellationToken,
    ) -> futures::future::BoxFuture<'a, Result<AggregatedResult>> {
        Box::pin(async move {
            match outcome {
                RoutingOutcome::Auto => Ok(self.aggregator.merge(&[], None, decision)),
                RoutingOutcome::ExpertConsultation => {
                    self.consult_experts(request, decision, deadline_ms, token).await
                }
                RoutingOutcome::HumanRequired => self.ask_human(request, decision, token).await,
                RoutingOutcome::Conditional => {
                    let branch = decision
                        .conditional
                        .map(|policy| policy.branch(request))
                        .unwrap_or(RoutingOutcome::Auto);
                    // Branches are terminal outcomes; a degenerate policy
                    // pointing back at CONDITIONAL is treated as AUTO.
                    let branch = if branch == RoutingOutcome::Conditional {
                        RoutingOutcome::Auto
                    } else {
                        branch
                    };
                    self.dispatch(request, decision, branch, deadline_ms, token).await
                }
            }
        })
    }

    async fn consult_experts(
        &self,
        request: &Request,
        decision: &RoutingDecision,
        deadline_ms: u64,
        token: &CancellationToken,
    ) -> Result<AggregatedResult> {
        // Re-resolve against current registry state: an expert that went
        // offline or degraded since the decision must not be invoked. Busy
        // experts stay in; they queue behind the semaphore.
        let mut experts: Vec<Expert> = Vec::new();
        for id in &decision.selected_experts {
            match self.registry.get(id) {
                Ok(Some(expert)) if expert.is_invokable() => experts.push(expert),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "registry unavailable during consultation");
                    return Err(Error::no_experts(request.id.to_string()));
                }
            }
        }
        if experts.is_empty() {
            return Err(Error::no_experts(request.id.to_string()));
        }

        let budget = Duration::from_millis(self.config.invoker_budget_ms(deadline_ms));
        let recommendations = self.invoker.invoke(experts, request, budget, token).await;
        let result = self.aggregator.merge(&recommendations, None, decision);

        if !self.aggregator.should_escalate(&result) {
            return Ok(result);
        }

        // High dissent: give a human the final word, but never fail the
        // request over an escalation that cannot be delivered.
        let prompt = templates::escalation_prompt(
            request,
            result.contributing_experts.len(),
            result.dissent_score,
        );
        match self.human.ask(&prompt, request, token).await {
            Ok(HumanOutcome::Answered(response)) => {
                Ok(self
                    .aggregator
                    .merge(&recommendations, Some(&response), decision))
            }
            Ok(HumanOutcome::Cancelled) if token.is_cancelled() => Err(Error::Cancelled),
            Ok(HumanOutcome::TimedOut) | Ok(HumanOutcome::Cancelled) => {
                warn!("dissent escalation went unanswered, keeping expert result");
                Ok(result)
            }
            Err(e) => {
                warn!(error = %e, "dissent escalation unavailable, keeping expert result");
                Ok(result)
            }
        }
    }

    async fn ask_human(
        &self,
        request: &Request,
        decision: &RoutingDecision,
        token: &CancellationToken,
    ) -> Result<AggregatedResult> {
        let prompt = decision
            .human_prompt
            .clone()
            .unwrap_or_else(|| templates::prompt_for(request));
        let session_timeout = prompt
            .kind
            .default_timeout_ms(&self.config.human_timeouts);

        match self.human.ask(&prompt, request, token).await? {
            HumanOutcome::Answered(response) => {
                Ok(self.aggregator.merge(&[], Some(&response), decision))
            }
            HumanOutcome::TimedOut => Err(Error::timeout(session_timeout)),
            HumanOutcome::Cancelled => Err(Error::Cancelled),
        }
    }

    /// Close the loop: one observation per delivered result.
    fn record(
        &self,
        request: &Request,
        decision: &RoutingDecision,
        result: &AggregatedResult,
        started: Instant,
        deadline_ms: u64,
    ) {
        let latency_ms = started.elapsed().as_millis() as u64;
        // Human input on a consultation path means the experts were
        // overridden; on the human path it was the plan all along.
        let overrode = result.human_input.is_some()
            && decision.outcome == RoutingOutcome::ExpertConsultation;
        self.optimizer.record(RoutingObservation {
            request_id: request.id.to_string(),
            features: FeatureVector::from_request(request),
            decision: decision.outcome,
            reward: reward(result.confidence, overrode, latency_ms, deadline_ms),
            timestamp: chrono::Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::human::PromptKind;
    use crate::invoker::BackendResponse;
    use crate::registry::{ExpertId, ExpertStatus};
    use crate::request::{Environment, RequestKind, RiskLevel, SystemImpact};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Per-expert scripted behaviour: delay, confidence, and output.
    #[derive(Default)]
    struct ScriptedBackend {
        behaviours: HashMap<String, (Duration, f64, Value)>,
        calls: AtomicU32,
    }

    impl ScriptedBackend {
        fn new() -> Self {
            Self::default()
        }

        fn script(mut self, id: &str, delay: Duration, confidence: f64, output: Value) -> Self {
            self.behaviours
                .insert(id.to_string(), (delay, confidence, output));
            self
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExpertBackend for ScriptedBackend {
        async fn invoke(&self, expert: &Expert, _request: &Request) -> Result<BackendResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (delay, confidence, output) = self
                .behaviours
                .get(expert.id.as_str())
                .cloned()
                .unwrap_or((Duration::ZERO, 0.8, json!({"verdict": "ok"})));
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(BackendResponse { output, confidence })
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        backend: Arc<ScriptedBackend>,
        interaction: Arc<InMemoryInteractionClient>,
    }

    fn harness(backend: ScriptedBackend) -> Harness {
        harness_with(backend, EngineConfig::default(), None)
    }

    fn harness_with(
        backend: ScriptedBackend,
        config: EngineConfig,
        rules: Option<Vec<RoutingRule>>,
    ) -> Harness {
        let backend = Arc::new(backend);
        let interaction = Arc::new(InMemoryInteractionClient::new());
        let mut builder = Orchestrator::builder()
            .with_config(config)
            .with_backend(Arc::clone(&backend) as Arc<dyn ExpertBackend>)
            .with_interaction_client(Arc::clone(&interaction) as Arc<dyn InteractionClient>);
        if let Some(rules) = rules {
            builder = builder.with_rules(rules);
        }
        Harness {
            orchestrator: builder.build().unwrap(),
            backend,
            interaction,
        }
    }

    fn consult_everything() -> Vec<RoutingRule> {
        vec![RoutingRule::new(
            "always-consult",
            RoutingOutcome::ExpertConsultation,
            0.9,
        )]
    }

    #[tokio::test]
    async fn test_auto_processes_low_risk_request() {
        let h = harness(ScriptedBackend::new());
        let request = Request::new(RequestKind::Analysis, json!("look at the build output"))
            .with_environment(Environment::Dev)
            .with_risk_level(RiskLevel::Low)
            .with_complexity(0.2);

        let result = h.orchestrator.process(request).await.unwrap();

        // Invoker never ran; the router's own recommendation came back.
        assert_eq!(h.backend.calls(), 0);
        assert!(result.confidence >= 0.5);
        assert!(result.contributing_experts.is_empty());
        // Exactly one observation reached the optimizer.
        assert_eq!(h.orchestrator.optimizer().recent(10).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prod_deployment_requires_human_confirmation() {
        let h = harness(ScriptedBackend::new());
        h.interaction.plan_answer(json!({"choice": "confirm"}));

        let request = Request::new(RequestKind::Deployment, json!("deploy api v2 to prod"))
            .with_environment(Environment::Prod)
            .with_system_impact(SystemImpact::High)
            .with_deadline_ms(600_000);

        let result = h.orchestrator.process(request).await.unwrap();

        assert_eq!(h.interaction.last_session_kind(), Some(PromptKind::Confirmation));
        assert_eq!(h.interaction.last_session_timeout_ms(), Some(120_000));
        assert_eq!(result.human_input, Some(json!({"choice": "confirm"})));
        assert!(result.confidence >= 0.8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_human_session_raises_timeout() {
        let h = harness(ScriptedBackend::new());
        h.interaction.plan_no_answer();

        let request = Request::new(RequestKind::Deployment, json!("deploy api v2 to prod"))
            .with_environment(Environment::Prod)
            .with_system_impact(SystemImpact::High)
            .with_deadline_ms(600_000);

        let result = h.orchestrator.process(request).await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expert_dissent_escalates_to_human() {
        let backend = ScriptedBackend::new()
            .script("technical", Duration::ZERO, 0.9, json!({"verdict": "approve"}))
            .script("security", Duration::ZERO, 0.85, json!({"verdict": "approve"}))
            .script("api", Duration::ZERO, 0.3, json!({"verdict": "block"}))
            .script("business", Duration::ZERO, 0.25, json!({"verdict": "block"}));
        let h = harness(backend);
        h.interaction.plan_answer(json!({"choice": "accept_majority"}));

        // Review needs are covered by four base experts; high complexity
        // widens the panel to all of them.
        let request = Request::new(RequestKind::Review, json!("please evaluate this change"))
            .with_environment(Environment::Staging)
            .with_complexity(0.8);

        let result = h.orchestrator.process(request).await.unwrap();

        assert_eq!(result.contributing_experts.len(), 4);
        assert!((result.dissent_score - 0.83).abs() < 0.05);
        // The escalation session was created and its answer is in the result.
        assert_eq!(h.interaction.session_count(), 1);
        assert_eq!(result.human_input, Some(json!({"choice": "accept_majority"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expert_timeout_absorbed() {
        let backend = ScriptedBackend::new()
            .script("technical", Duration::from_millis(10), 0.9, json!({"verdict": "ok"}))
            .script("security", Duration::from_secs(120), 0.9, json!({"verdict": "ok"}));
        let h = harness_with(backend, EngineConfig::default(), Some(consult_everything()));

        // Low complexity keeps the panel at the two best review experts.
        let request = Request::new(RequestKind::Review, json!("please evaluate this change"))
            .with_environment(Environment::Staging)
            .with_complexity(0.2)
            .with_deadline_ms(300_000);

        let result = h.orchestrator.process(request).await.unwrap();

        assert_eq!(result.contributing_experts, vec![ExpertId::new("technical")]);
        let slow = h
            .orchestrator
            .registry()
            .get(&ExpertId::new("security"))
            .unwrap()
            .unwrap();
        assert_eq!(slow.stats.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_dynamic_expert_creation_is_idempotent_across_requests() {
        let h = harness(ScriptedBackend::new());

        let make_request = || {
            Request::new(
                RequestKind::Maintenance,
                json!("debug the failing database migration"),
            )
            .with_environment(Environment::Staging)
            .with_complexity(0.8)
        };

        let (a, b) = tokio::join!(
            h.orchestrator.process(make_request()),
            h.orchestrator.process(make_request()),
        );
        let a = a.unwrap();
        let b = b.unwrap();

        // Exactly one dynamic expert exists, and both requests used it.
        let registry = h.orchestrator.registry();
        let dynamic: Vec<ExpertId> = registry
            .snapshot()
            .unwrap()
            .values()
            .filter(|e| e.expert_type.is_dynamic())
            .map(|e| e.id.clone())
            .collect();
        assert_eq!(dynamic.len(), 1);
        assert!(a.contributing_experts.contains(&dynamic[0]));
        assert!(b.contributing_experts.contains(&dynamic[0]));
    }

    #[tokio::test]
    async fn test_no_selectable_experts_raises() {
        let h = harness(ScriptedBackend::new());
        let request = Request::new(RequestKind::Review, json!("evaluate"));
        let decision = RoutingDecision {
            request_id: request.id.to_string(),
            outcome: RoutingOutcome::ExpertConsultation,
            confidence: 0.8,
            rationale: "test".into(),
            selected_experts: vec![ExpertId::new("security")],
            human_prompt: None,
            conditional: None,
            fallback_outcome: RoutingOutcome::Auto,
            auto_recommendation: None,
        };

        // The selected expert went offline between decision and dispatch.
        h.orchestrator
            .registry()
            .deregister(&ExpertId::new("security"))
            .await
            .unwrap();

        let result = h
            .orchestrator
            .dispatch(
                &request,
                &decision,
                decision.outcome,
                60_000,
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(Error::NoExpertsAvailable { .. })));
        assert_eq!(
            h.orchestrator
                .registry()
                .get(&ExpertId::new("security"))
                .unwrap()
                .unwrap()
                .status,
            ExpertStatus::Offline
        );
    }

    #[tokio::test]
    async fn test_fallback_policy() {
        let h = harness(ScriptedBackend::new());
        let decision = |fallback| RoutingDecision {
            request_id: "req".into(),
            outcome: RoutingOutcome::ExpertConsultation,
            confidence: 0.8,
            rationale: "test".into(),
            selected_experts: Vec::new(),
            human_prompt: None,
            conditional: None,
            fallback_outcome: fallback,
            auto_recommendation: None,
        };

        let no_experts = Error::no_experts("req");
        let human_down = Error::human_loop_unavailable("503");

        // A failed consultation only falls back to a human.
        assert!(h
            .orchestrator
            .fallback_applies(&no_experts, &decision(RoutingOutcome::HumanRequired)));
        assert!(!h
            .orchestrator
            .fallback_applies(&no_experts, &decision(RoutingOutcome::Auto)));
        // A failed human loop falls back only when policy allows it.
        assert!(!h
            .orchestrator
            .fallback_applies(&human_down, &decision(RoutingOutcome::Auto)));
        // Timeouts always surface.
        assert!(!h
            .orchestrator
            .fallback_applies(&Error::timeout(5), &decision(RoutingOutcome::Auto)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_human_loop_unavailable_falls_back_when_allowed() {
        let mut config = EngineConfig::default();
        config.allow_auto_fallback = true;
        let h = harness_with(ScriptedBackend::new(), config, None);
        // Exhaust all three create attempts.
        h.interaction.fail_creates(3);

        let request = Request::new(RequestKind::Deployment, json!("deploy api to prod"))
            .with_environment(Environment::Prod)
            .with_system_impact(SystemImpact::High)
            .with_deadline_ms(600_000);

        // Primary path (human) fails; the fallback outcome handles it.
        let result = h.orchestrator.process(request).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_human_loop_unavailable_surfaces_by_default() {
        let h = harness(ScriptedBackend::new());
        h.interaction.fail_creates(3);

        let request = Request::new(RequestKind::Deployment, json!("deploy api to prod"))
            .with_environment(Environment::Prod)
            .with_system_impact(SystemImpact::High)
            .with_deadline_ms(600_000);

        let result = h.orchestrator.process(request).await;
        assert!(matches!(result, Err(Error::HumanLoopUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_invalid_request_rejected_before_routing() {
        let h = harness(ScriptedBackend::new());
        let request = Request::new(RequestKind::Analysis, Value::Null);
        let result = h.orchestrator.process(request).await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
        // Nothing was recorded for a rejected request.
        assert_eq!(h.orchestrator.optimizer().recent(10).len(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_propagates() {
        let h = harness(ScriptedBackend::new());
        let request = Request::new(RequestKind::Deployment, json!("deploy api to prod"))
            .with_environment(Environment::Prod)
            .with_system_impact(SystemImpact::High);

        let token = CancellationToken::new();
        token.cancel();
        let result = h.orchestrator.process_with_token(request, token).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_deadline_dominates() {
        let h = harness(ScriptedBackend::new());
        // Human path that never answers, with a request deadline far below
        // the 120 s session timeout: the outer deadline wins.
        h.interaction.plan_no_answer();
        let request = Request::new(RequestKind::Deployment, json!("deploy api to prod"))
            .with_environment(Environment::Prod)
            .with_system_impact(SystemImpact::High)
            .with_deadline_ms(5_000);

        let result = h.orchestrator.process(request).await;
        assert!(matches!(
            result,
            Err(Error::Timeout { duration_ms: 5_000 })
        ));
    }

    #[tokio::test]
    async fn test_conditional_dispatch_branches() {
        // Rule-only weights make the prod/destructive request CONDITIONAL;
        // medium risk sends the policy down the consultation branch.
        let config =
            EngineConfig::default().with_strategy_weights(crate::config::StrategyWeights::rule_only());
        let h = harness_with(ScriptedBackend::new(), config, None);

        let request = Request::new(RequestKind::Deployment, json!("roll out the new config"))
            .with_environment(Environment::Prod)
            .with_system_impact(SystemImpact::Medium);

        let result = h.orchestrator.process(request).await.unwrap();
        // The consultation branch ran experts.
        assert!(h.backend.calls() > 0);
        assert!(!result.contributing_experts.is_empty());
    }

    #[tokio::test]
    async fn test_maintenance_tasks_shut_down() {
        let h = harness(ScriptedBackend::new());
        let maintenance = h.orchestrator.start_maintenance();
        maintenance.shutdown().await;
    }
}
