//! # quorum-core
//!
//! A dynamic expert routing and execution engine. Requests are routed by a
//! weighted combination of rule, history, role, and learned signals; relevant
//! experts run concurrently under a budget; their recommendations merge with
//! confidence weighting and optional human input; and every completed request
//! feeds an incremental optimizer that retrains the learned routing signal.
//!
//! ## Core components
//!
//! - **Registry**: the expert population, capability matching, and lifecycle
//! - **Invoker**: concurrent expert execution with nested timeouts
//! - **Aggregator**: confidence-weighted merging and dissent detection
//! - **Human loop**: session-correlated interaction with an external service
//! - **Router**: the per-request decision
//! - **Optimizer**: observation log, reward, and the learned scorer
//! - **Orchestrator**: the public `process(request)` entry point
//!
//! ## Example
//!
//! ```rust,ignore
//! use quorum_core::{Orchestrator, Request, RequestKind};
//!
//! let orchestrator = Orchestrator::builder()
//!     .with_backend(backend)
//!     .build()?;
//!
//! let request = Request::new(RequestKind::Analysis, serde_json::json!("audit the auth flow"));
//! let result = orchestrator.process(request).await?;
//! println!("{} (confidence {:.2})", result.recommendation, result.confidence);
//! ```

pub mod aggregator;
pub mod config;
pub mod error;
pub mod human;
pub mod invoker;
pub mod optimizer;
pub mod orchestrator;
pub mod registry;
pub mod request;
pub mod router;

// Re-exports for convenience
pub use aggregator::{AggregatedResult, Aggregator};
pub use config::{EngineConfig, HumanTimeouts, RetryConfig, StrategyWeights};
pub use error::{Error, Result};
pub use human::{
    HttpInteractionClient, HumanLoopAdapter, HumanOutcome, HumanPrompt, HumanResponse,
    InMemoryInteractionClient, InteractionClient, InteractionSession, PromptField, PromptKind,
    SessionId, SessionSnapshot, SessionStatus,
};
pub use invoker::{BackendResponse, ExpertBackend, ExpertInvoker, ExpertRecommendation};
pub use optimizer::{
    reward, ObservationStore, Optimizer, RoutingObservation, ScoringModel,
    SqliteObservationStore, TrainConfig, TrainOutcome,
};
pub use orchestrator::{Maintenance, Orchestrator, OrchestratorBuilder};
pub use registry::{
    capability_needs, extract_domain_tags, CapabilityVector, Expert, ExpertId, ExpertRegistry,
    ExpertStatus, ExpertType, PerformanceStats, ScenarioSignature, StatusCounts,
};
pub use request::{
    DataSensitivity, Environment, Priority, Request, RequestId, RequestKind, RequestMetadata,
    RequesterRole, RiskLevel, SystemImpact,
};
pub use router::{
    default_rules, Condition, ConditionalPolicy, FeatureVector, HistoryStrategy, LearnedStrategy,
    RoleStrategy, Router, RouterState, RoutingDecision, RoutingOutcome, RoutingRule,
    RoutingStrategy, RulePredicate, RuleStrategy, StrategyVote,
};
