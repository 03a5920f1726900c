//! Human-in-the-loop adapter.
//!
//! Bridges the engine to the external interaction service: builds a session,
//! submits it with bounded backoff, polls until the service reports a
//! terminal state, and forwards cancellation best-effort. The service is the
//! authority on session state; the adapter only correlates in-flight asks.

pub mod client;
pub mod types;

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::request::Request;

pub use client::{HttpInteractionClient, InMemoryInteractionClient, InteractionClient, SessionSnapshot};
pub use types::{
    HumanOutcome, HumanPrompt, HumanResponse, InteractionSession, PromptField, PromptKind,
    SessionId, SessionStatus,
};

/// Default interval between session polls.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Requester id used when the request declares none.
const ANONYMOUS: &str = "anonymous";

/// Session-correlated bridge to the interaction service.
pub struct HumanLoopAdapter {
    client: Arc<dyn InteractionClient>,
    config: EngineConfig,
    poll_interval: Duration,
    outstanding: Mutex<HashMap<String, usize>>,
}

impl HumanLoopAdapter {
    pub fn new(client: Arc<dyn InteractionClient>, config: EngineConfig) -> Self {
        Self {
            client,
            config,
            poll_interval: DEFAULT_POLL_INTERVAL,
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Ask a human and wait for a terminal outcome.
    ///
    /// Returns `HumanOutcome::TimedOut` / `Cancelled` as values: the caller
    /// decides whether those are errors at its level. `Err` is reserved for
    /// the service being unreachable and for per-requester backpressure.
    #[instrument(skip_all, fields(request_id = %request.id, kind = ?prompt.kind))]
    pub async fn ask(
        &self,
        prompt: &HumanPrompt,
        request: &Request,
        token: &CancellationToken,
    ) -> Result<HumanOutcome> {
        let requester = request.requester().unwrap_or(ANONYMOUS).to_string();
        let _slot = self.acquire_slot(&requester)?;

        let timeout_ms = prompt.kind.default_timeout_ms(&self.config.human_timeouts);
        let now = Utc::now();
        let session = InteractionSession {
            session_id: SessionId::new(),
            request_id: request.id.to_string(),
            prompt: prompt.clone(),
            status: SessionStatus::Pending,
            created_at: now,
            expires_at: now + ChronoDuration::milliseconds(timeout_ms as i64),
            response: None,
            // One token per ask, shared by the submit retries below, so the
            // service sees re-delivery rather than duplicate sessions.
            idempotency_token: Uuid::new_v4().to_string(),
        };

        let session_id = self.submit(&session).await?;
        info!(session = %session_id, timeout_ms, "interaction session created");

        self.poll(&session_id, timeout_ms, token).await
    }

    /// Submit the session with exponential backoff, max 3 attempts.
    async fn submit(&self, session: &InteractionSession) -> Result<SessionId> {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            match self.client.create_session(session).await {
                Ok(id) => return Ok(id),
                Err(e) if e.is_transient() && attempt < retry.max_retries => {
                    debug!(error = %e, attempt, "create_session failed, backing off");
                    tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Error::human_loop_unavailable(format!(
                        "create_session failed after {} attempts: {e}",
                        attempt + 1
                    )));
                }
            }
        }
    }

    /// Poll the session until terminal, the deadline, or cancellation.
    async fn poll(
        &self,
        session_id: &SessionId,
        timeout_ms: u64,
        token: &CancellationToken,
    ) -> Result<HumanOutcome> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    self.cancel_best_effort(session_id.clone());
                    return Ok(HumanOutcome::Cancelled);
                }
                _ = ticker.tick() => {
                    if tokio::time::Instant::now() >= deadline {
                        self.cancel_best_effort(session_id.clone());
                        return Ok(HumanOutcome::TimedOut);
                    }
                    match self.client.get_session(session_id).await {
                        Ok(snapshot) => match snapshot.status {
                            SessionStatus::Answered => {
                                return Ok(HumanOutcome::Answered(HumanResponse {
                                    session_id: session_id.clone(),
                                    value: snapshot.response.unwrap_or_default(),
                                    answered_at: Utc::now(),
                                }));
                            }
                            SessionStatus::Timeout => return Ok(HumanOutcome::TimedOut),
                            SessionStatus::Cancelled => return Ok(HumanOutcome::Cancelled),
                            SessionStatus::Pending => {}
                        },
                        // Transient poll failures just wait for the next tick;
                        // the deadline bounds how long that can go on.
                        Err(e) => warn!(error = %e, "session poll failed"),
                    }
                }
            }
        }
    }

    /// Fire a cancel without blocking the caller on the service's answer.
    fn cancel_best_effort(&self, session_id: SessionId) {
        let client = Arc::clone(&self.client);
        tokio::spawn(async move {
            if let Err(e) = client.cancel_session(&session_id).await {
                debug!(session = %session_id, error = %e, "best-effort cancel failed");
            }
        });
    }

    /// Bound outstanding sessions per requester.
    fn acquire_slot(&self, requester: &str) -> Result<OutstandingSlot<'_>> {
        let mut outstanding = self
            .outstanding
            .lock()
            .map_err(|_| Error::InternalInvariant("outstanding-session lock poisoned".into()))?;
        let count = outstanding.entry(requester.to_string()).or_insert(0);
        if *count >= self.config.max_sessions_per_requester {
            return Err(Error::human_loop_unavailable(format!(
                "requester {requester} has {count} outstanding sessions"
            )));
        }
        *count += 1;
        Ok(OutstandingSlot {
            adapter: self,
            requester: requester.to_string(),
        })
    }

    fn release_slot(&self, requester: &str) {
        if let Ok(mut outstanding) = self.outstanding.lock() {
            if let Some(count) = outstanding.get_mut(requester) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    outstanding.remove(requester);
                }
            }
        }
    }
}

/// Releases the requester's session slot when the ask finishes.
struct OutstandingSlot<'a> {
    adapter: &'a HumanLoopAdapter,
    requester: String,
}

impl Drop for OutstandingSlot<'_> {
    fn drop(&mut self) {
        self.adapter.release_slot(&self.requester);
    }
}
