//! Concurrent expert invocation under time and concurrency budgets.
//!
//! The invoker fans out to the selected experts through a semaphore, applies
//! the per-expert timeout to each call, and enforces an aggregate budget over
//! the whole batch. Expert failures are captured into recommendations and
//! never propagate upward; the aggregator decides what they mean.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::registry::{Expert, ExpertId, ExpertRegistry};
use crate::request::Request;

/// What an expert backend returns for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendResponse {
    /// Free-form recommendation payload.
    pub output: Value,
    /// Backend-reported confidence in [0, 1].
    pub confidence: f64,
}

/// Callable surface backing every expert.
///
/// Implementations may be local or remote; they must respect cancellation
/// (the invoker drops the future on timeout or budget expiry).
#[async_trait]
pub trait ExpertBackend: Send + Sync {
    async fn invoke(&self, expert: &Expert, request: &Request) -> Result<BackendResponse>;
}

/// One expert's answer for a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertRecommendation {
    pub expert_id: ExpertId,
    pub output: Value,
    pub confidence: f64,
    pub latency_ms: u64,
    pub error: Option<String>,
}

impl ExpertRecommendation {
    pub fn success(expert_id: ExpertId, response: BackendResponse, latency_ms: u64) -> Self {
        Self {
            expert_id,
            output: response.output,
            confidence: response.confidence.clamp(0.0, 1.0),
            latency_ms,
            error: None,
        }
    }

    pub fn failure(expert_id: ExpertId, error: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            expert_id,
            output: Value::Null,
            confidence: 0.0,
            latency_ms,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Invokes experts concurrently and records their performance.
pub struct ExpertInvoker {
    backend: Arc<dyn ExpertBackend>,
    registry: Arc<ExpertRegistry>,
    max_concurrent: usize,
    expert_timeout: Duration,
    retry_delay: Duration,
}

impl ExpertInvoker {
    pub fn new(
        backend: Arc<dyn ExpertBackend>,
        registry: Arc<ExpertRegistry>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            max_concurrent: config.max_concurrent_experts.max(1),
            expert_timeout: Duration::from_millis(config.expert_timeout_ms),
            retry_delay: config.retry.delay_for_attempt(0),
        }
    }

    /// Invoke all experts for a request.
    ///
    /// Returns recommendations in completion order. The aggregate `budget`
    /// cancels experts still pending when it fires; output already produced
    /// is retained. Expert-level failures become error recommendations.
    #[instrument(skip_all, fields(request_id = %request.id, experts = experts.len()))]
    pub async fn invoke(
        &self,
        experts: Vec<Expert>,
        request: &Request,
        budget: Duration,
        token: &CancellationToken,
    ) -> Vec<ExpertRecommendation> {
        if experts.is_empty() {
            return Vec::new();
        }

        // Child token: budget expiry cancels pending work without touching
        // the caller's token.
        let batch_token = token.child_token();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));

        let mut in_flight: FuturesUnordered<_> = experts
            .into_iter()
            .map(|expert| {
                let semaphore = Arc::clone(&semaphore);
                let batch_token = batch_token.clone();
                async move {
                    // FIFO queue past the fan-out cap.
                    let _permit = match semaphore.acquire().await {
                        Ok(permit) => permit,
                        Err(_) => return None,
                    };
                    if batch_token.is_cancelled() {
                        return None;
                    }
                    tokio::select! {
                        rec = self.invoke_one(&expert, request) => Some(rec),
                        _ = batch_token.cancelled() => {
                            // Cancelled mid-flight: restore the expert
                            // without counting the call against it.
                            let _ = self.registry.mark_idle(&expert.id).await;
                            None
                        }
                    }
                }
            })
            .collect();

        let mut recommendations = Vec::new();
        let mut cancelled = false;
        let deadline = tokio::time::sleep(budget);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                next = in_flight.next() => match next {
                    Some(Some(rec)) => recommendations.push(rec),
                    Some(None) => {}
                    None => break,
                },
                _ = &mut deadline, if !cancelled => {
                    debug!("invocation budget exhausted, cancelling stragglers");
                    cancelled = true;
                    batch_token.cancel();
                }
                _ = token.cancelled(), if !cancelled => {
                    cancelled = true;
                    batch_token.cancel();
                }
            }
        }

        recommendations
    }

    /// Invoke a single expert with timeout, one transient retry, and status
    /// bookkeeping.
    async fn invoke_one(&self, expert: &Expert, request: &Request) -> ExpertRecommendation {
        if let Err(e) = self.registry.mark_busy(&expert.id).await {
            return ExpertRecommendation::failure(expert.id.clone(), e.to_string(), 0);
        }

        let start = Instant::now();
        let mut attempt = 0;
        let outcome = loop {
            let call = self.backend.invoke(expert, request);
            match tokio::time::timeout(self.expert_timeout, call).await {
                Ok(Ok(response)) => break Ok(response),
                Ok(Err(e)) if e.is_transient() && attempt == 0 => {
                    attempt += 1;
                    debug!(expert = %expert.id, error = %e, "transient failure, retrying once");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Ok(Err(e)) => break Err(e.to_string()),
                Err(_) => break Err("timeout".to_string()),
            }
        };
        let latency_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(response) => {
                let rec = ExpertRecommendation::success(expert.id.clone(), response, latency_ms);
                let _ = self
                    .registry
                    .record_success(&expert.id, latency_ms, rec.confidence)
                    .await;
                rec
            }
            Err(message) => {
                warn!(expert = %expert.id, error = %message, "expert invocation failed");
                let _ = self.registry.record_failure(&expert.id).await;
                ExpertRecommendation::failure(expert.id.clone(), message, latency_ms)
            }
        }
    }
}
