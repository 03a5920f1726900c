//! Interaction-service clients.
//!
//! The external service owns session state; clients only create sessions,
//! read them back, and request cancellation. [`HttpInteractionClient`] talks
//! to a real deployment; [`InMemoryInteractionClient`] is a scriptable double
//! for tests and local development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::human::types::{InteractionSession, SessionId, SessionStatus};

/// A session's externally visible state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub response: Option<Value>,
    pub expires_at: DateTime<Utc>,
}

/// Protocol surface of the external interaction service.
#[async_trait]
pub trait InteractionClient: Send + Sync {
    /// Register a session. Idempotent under the session's idempotency token:
    /// re-delivery with identical fields returns the same session id.
    async fn create_session(&self, session: &InteractionSession) -> Result<SessionId>;

    /// Read a session's current state.
    async fn get_session(&self, id: &SessionId) -> Result<SessionSnapshot>;

    /// Request cancellation. The service may have already reached a terminal
    /// state; that is not an error.
    async fn cancel_session(&self, id: &SessionId) -> Result<()>;
}

// Wire types for the HTTP service.
#[derive(Debug, Serialize)]
struct CreateSessionBody<'a> {
    session_id: &'a SessionId,
    request_id: &'a str,
    kind: &'a str,
    title: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    options: Vec<&'a str>,
    timeout_ms: i64,
    idempotency_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateSessionReply {
    session_id: SessionId,
}

#[derive(Debug, Deserialize)]
struct GetSessionReply {
    status: SessionStatus,
    response: Option<Value>,
    expires_at: DateTime<Utc>,
}

/// HTTP client for the interaction service.
pub struct HttpInteractionClient {
    base_url: String,
    http: Client,
}

impl HttpInteractionClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::human_loop_unavailable(format!("http client: {e}")))?;
        Ok(Self {
            base_url: base_url.into(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl InteractionClient for HttpInteractionClient {
    async fn create_session(&self, session: &InteractionSession) -> Result<SessionId> {
        let kind = serde_json::to_value(session.prompt.kind)?;
        let timeout_ms = (session.expires_at - session.created_at).num_milliseconds();
        let body = CreateSessionBody {
            session_id: &session.session_id,
            request_id: &session.request_id,
            kind: kind.as_str().unwrap_or("confirmation"),
            title: &session.prompt.title,
            message: &session.prompt.message,
            options: session.prompt.options.iter().map(String::as_str).collect(),
            timeout_ms,
            idempotency_token: &session.idempotency_token,
        };

        let response = self
            .http
            .post(self.url("sessions"))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::TransientBackend(format!("create_session: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::TransientBackend(format!(
                "create_session: service returned {}",
                response.status()
            )));
        }
        let reply: CreateSessionReply = response
            .json()
            .await
            .map_err(|e| Error::TransientBackend(format!("create_session decode: {e}")))?;
        Ok(reply.session_id)
    }

    async fn get_session(&self, id: &SessionId) -> Result<SessionSnapshot> {
        let response = self
            .http
            .get(self.url(&format!("sessions/{id}")))
            .send()
            .await
            .map_err(|e| Error::TransientBackend(format!("get_session: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::TransientBackend(format!(
                "get_session: service returned {}",
                response.status()
            )));
        }
        let reply: GetSessionReply = response
            .json()
            .await
            .map_err(|e| Error::TransientBackend(format!("get_session decode: {e}")))?;
        Ok(SessionSnapshot {
            status: reply.status,
            response: reply.response,
            expires_at: reply.expires_at,
        })
    }

    async fn cancel_session(&self, id: &SessionId) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("sessions/{id}/cancel")))
            .send()
            .await
            .map_err(|e| Error::TransientBackend(format!("cancel_session: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::TransientBackend(format!(
                "cancel_session: service returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Planned outcome for one scripted session.
#[derive(Debug, Clone)]
enum ScriptedPlan {
    /// Answer with the value after N polls.
    AnswerAfterPolls(u32, Value),
    /// Stay pending until the session expires.
    NeverAnswer,
    /// Report cancelled after N polls.
    CancelAfterPolls(u32),
}

struct ScriptedSession {
    session: InteractionSession,
    plan: ScriptedPlan,
    polls: u32,
    terminal: Option<(SessionStatus, Option<Value>)>,
}

#[derive(Default)]
struct InMemoryState {
    // Keyed by idempotency token so re-delivery maps to the same session.
    by_token: HashMap<String, SessionId>,
    sessions: HashMap<SessionId, ScriptedSession>,
    plans: Vec<ScriptedPlan>,
    create_failures_remaining: u32,
    create_calls: u32,
    cancel_calls: u32,
}

/// In-memory interaction service double.
///
/// Outcomes are scripted per session in creation order; the default plan
/// answers `{"choice": "confirm"}` on the first poll.
pub struct InMemoryInteractionClient {
    state: Mutex<InMemoryState>,
}

impl InMemoryInteractionClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InMemoryState::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, InMemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::InternalInvariant("interaction client lock poisoned".into()))
    }

    /// Script the next session to answer with `value` on its first poll.
    pub fn plan_answer(&self, value: Value) -> &Self {
        if let Ok(mut state) = self.lock() {
            state.plans.push(ScriptedPlan::AnswerAfterPolls(1, value));
        }
        self
    }

    /// Script the next session to answer after `polls` polls.
    pub fn plan_answer_after(&self, polls: u32, value: Value) -> &Self {
        if let Ok(mut state) = self.lock() {
            state
                .plans
                .push(ScriptedPlan::AnswerAfterPolls(polls, value));
        }
        self
    }

    /// Script the next session to never answer (it will expire).
    pub fn plan_no_answer(&self) -> &Self {
        if let Ok(mut state) = self.lock() {
            state.plans.push(ScriptedPlan::NeverAnswer);
        }
        self
    }

    /// Script the next session to be cancelled by the service side.
    pub fn plan_service_cancel(&self, polls: u32) -> &Self {
        if let Ok(mut state) = self.lock() {
            state.plans.push(ScriptedPlan::CancelAfterPolls(polls));
        }
        self
    }

    /// Fail the next `n` create calls with a transient error.
    pub fn fail_creates(&self, n: u32) -> &Self {
        if let Ok(mut state) = self.lock() {
            state.create_failures_remaining = n;
        }
        self
    }

    /// How many create calls the service has seen.
    pub fn create_calls(&self) -> u32 {
        self.lock().map(|s| s.create_calls).unwrap_or(0)
    }

    /// How many cancel calls the service has seen.
    pub fn cancel_calls(&self) -> u32 {
        self.lock().map(|s| s.cancel_calls).unwrap_or(0)
    }

    /// Distinct sessions registered.
    pub fn session_count(&self) -> usize {
        self.lock().map(|s| s.sessions.len()).unwrap_or(0)
    }

    /// Timeout of the most recently registered session, in milliseconds.
    pub fn last_session_timeout_ms(&self) -> Option<i64> {
        self.lock().ok().and_then(|s| {
            s.sessions
                .values()
                .max_by_key(|scripted| scripted.session.created_at)
                .map(|scripted| {
                    (scripted.session.expires_at - scripted.session.created_at).num_milliseconds()
                })
        })
    }

    /// Prompt kind of the most recently registered session.
    pub fn last_session_kind(&self) -> Option<crate::human::types::PromptKind> {
        self.lock().ok().and_then(|s| {
            s.sessions
                .values()
                .max_by_key(|scripted| scripted.session.created_at)
                .map(|scripted| scripted.session.prompt.kind)
        })
    }
}

impl Default for InMemoryInteractionClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InteractionClient for InMemoryInteractionClient {
    async fn create_session(&self, session: &InteractionSession) -> Result<SessionId> {
        let mut state = self.lock()?;
        state.create_calls += 1;

        if state.create_failures_remaining > 0 {
            state.create_failures_remaining -= 1;
            return Err(Error::TransientBackend(
                "create_session: service returned 503".into(),
            ));
        }

        // Idempotent re-delivery returns the existing session.
        if let Some(existing) = state.by_token.get(&session.idempotency_token) {
            return Ok(existing.clone());
        }

        let plan = if state.plans.is_empty() {
            ScriptedPlan::AnswerAfterPolls(1, serde_json::json!({ "choice": "confirm" }))
        } else {
            state.plans.remove(0)
        };

        let id = session.session_id.clone();
        state
            .by_token
            .insert(session.idempotency_token.clone(), id.clone());
        state.sessions.insert(
            id.clone(),
            ScriptedSession {
                session: session.clone(),
                plan,
                polls: 0,
                terminal: None,
            },
        );
        Ok(id)
    }

    async fn get_session(&self, id: &SessionId) -> Result<SessionSnapshot> {
        let mut state = self.lock()?;
        let scripted = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::TransientBackend(format!("unknown session {id}")))?;

        if let Some((status, response)) = &scripted.terminal {
            return Ok(SessionSnapshot {
                status: *status,
                response: response.clone(),
                expires_at: scripted.session.expires_at,
            });
        }

        scripted.polls += 1;
        let (status, response) = match &scripted.plan {
            ScriptedPlan::AnswerAfterPolls(n, value) if scripted.polls >= *n => {
                (SessionStatus::Answered, Some(value.clone()))
            }
            ScriptedPlan::CancelAfterPolls(n) if scripted.polls >= *n => {
                (SessionStatus::Cancelled, None)
            }
            _ => (SessionStatus::Pending, None),
        };
        if status.is_terminal() {
            // Terminal is terminal: later polls and cancels see this state.
            scripted.terminal = Some((status, response.clone()));
        }
        Ok(SessionSnapshot {
            status,
            response,
            expires_at: scripted.session.expires_at,
        })
    }

    async fn cancel_session(&self, id: &SessionId) -> Result<()> {
        let mut state = self.lock()?;
        state.cancel_calls += 1;
        if let Some(scripted) = state.sessions.get_mut(id) {
            if scripted.terminal.is_none() {
                scripted.terminal = Some((SessionStatus::Cancelled, None));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::human::types::HumanPrompt;
    use serde_json::json;

    fn session(token: &str) -> InteractionSession {
        let now = Utc::now();
        InteractionSession {
            session_id: SessionId::new(),
            request_id: "req-1".into(),
            prompt: HumanPrompt::confirmation("Deploy?", "Deploy api to prod"),
            status: SessionStatus::Pending,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(120),
            response: None,
            idempotency_token: token.into(),
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent_per_token() {
        let client = InMemoryInteractionClient::new();
        let first = session("tok-1");
        let id_a = client.create_session(&first).await.unwrap();

        // Re-delivery with a fresh session id but the same token maps to the
        // original session.
        let mut redelivered = session("tok-1");
        redelivered.session_id = SessionId::new();
        let id_b = client.create_session(&redelivered).await.unwrap();

        assert_eq!(id_a, id_b);
        assert_eq!(client.session_count(), 1);
    }

    #[tokio::test]
    async fn test_scripted_answer_after_polls() {
        let client = InMemoryInteractionClient::new();
        client.plan_answer_after(2, json!({"choice": "reject"}));
        let id = client.create_session(&session("tok-2")).await.unwrap();

        let snap = client.get_session(&id).await.unwrap();
        assert_eq!(snap.status, SessionStatus::Pending);

        let snap = client.get_session(&id).await.unwrap();
        assert_eq!(snap.status, SessionStatus::Answered);
        assert_eq!(snap.response, Some(json!({"choice": "reject"})));
    }

    #[tokio::test]
    async fn test_terminal_state_is_sticky() {
        let client = InMemoryInteractionClient::new();
        client.plan_answer(json!({"choice": "confirm"}));
        let id = client.create_session(&session("tok-3")).await.unwrap();

        let snap = client.get_session(&id).await.unwrap();
        assert_eq!(snap.status, SessionStatus::Answered);

        // A cancel after answering does not rewrite history.
        client.cancel_session(&id).await.unwrap();
        let snap = client.get_session(&id).await.unwrap();
        assert_eq!(snap.status, SessionStatus::Answered);
    }

    #[tokio::test]
    async fn test_create_failure_injection() {
        let client = InMemoryInteractionClient::new();
        client.fail_creates(1);
        assert!(client.create_session(&session("tok-4")).await.is_err());
        assert!(client.create_session(&session("tok-4")).await.is_ok());
        assert_eq!(client.create_calls(), 2);
    }
}
