//! Runtime command surface for agent sessions.
//!
//! These are the operations a transport façade (REST, RPC, CLI) calls:
//! submit, get, pause, resume, continue, abort, subscribe. Each session
//! loop runs on its own spawned task — tasks are cheap, thousands of
//! concurrent sessions are the design point.
//!
//! Pause and abort are cooperative: they write the session row, and the
//! loop observes the change at the top of its next iteration. The
//! currently executing LLM or tool call finishes first; nothing is lost
//! because context is persisted as it grows.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use agentforge_core::error::{Error, StoreError};
use agentforge_core::event::{AgentEvent, EventPublisher};
use agentforge_core::message::ChatMessage;
use agentforge_core::session::{Session, SessionStatus};
use agentforge_store::{ContextStore, SessionStore};

use crate::loop_runner::AgentLoop;

pub struct AgentRuntime {
    sessions: Arc<SessionStore>,
    context: Arc<ContextStore>,
    publisher: Arc<EventPublisher>,
    agent_loop: Arc<AgentLoop>,
}

impl AgentRuntime {
    pub fn new(
        sessions: Arc<SessionStore>,
        context: Arc<ContextStore>,
        publisher: Arc<EventPublisher>,
        agent_loop: Arc<AgentLoop>,
    ) -> Self {
        Self {
            sessions,
            context,
            publisher,
            agent_loop,
        }
    }

    /// Create a new session and immediately launch its thinking loop.
    /// `Conflict` when the caller-supplied id is already taken.
    pub async fn submit(
        &self,
        task: &str,
        session_id: Option<String>,
        user_id: Option<i64>,
    ) -> Result<Session, Error> {
        if task.trim().is_empty() {
            return Err(Error::Validation("task must not be blank".into()));
        }

        let session_id = session_id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if session_id.len() > 64 {
            return Err(Error::Validation("session id must be at most 64 chars".into()));
        }

        let session = self.sessions.create(&session_id, user_id, task).await?;
        self.spawn_loop(session.clone());

        let preview: String = task.chars().take(80).collect();
        info!(%session_id, task = %preview, "session submitted");
        Ok(session)
    }

    /// Poll the current state (and result, once COMPLETED).
    pub async fn get(&self, session_id: &str) -> Result<Session, Error> {
        Ok(self.find_or_not_found(session_id).await?)
    }

    /// Pause a running session. The loop idles between iterations until
    /// resumed. `Conflict` when the session is not RUNNING.
    pub async fn pause(&self, session_id: &str) -> Result<Session, Error> {
        let session = self.find_or_not_found(session_id).await?;
        if session.status != SessionStatus::Running {
            return Err(StoreError::Conflict(format!(
                "Session is not RUNNING, current status: {}",
                session.status
            ))
            .into());
        }
        let paused = self
            .sessions
            .update_by_id(session.id, |s| s.status = SessionStatus::Paused)
            .await?;
        self.publisher
            .publish(AgentEvent::status_change(session_id, "PAUSED"));
        info!(session_id, "paused");
        Ok(paused)
    }

    /// Resume a paused session; the loop's poll notices within one
    /// interval. `Conflict` when the session is not PAUSED.
    pub async fn resume(&self, session_id: &str) -> Result<Session, Error> {
        let session = self.find_or_not_found(session_id).await?;
        if session.status != SessionStatus::Paused {
            return Err(StoreError::Conflict(format!(
                "Session is not PAUSED, current status: {}",
                session.status
            ))
            .into());
        }
        let resumed = self
            .sessions
            .update_by_id(session.id, |s| s.status = SessionStatus::Running)
            .await?;
        self.publisher
            .publish(AgentEvent::status_change(session_id, "RUNNING"));
        info!(session_id, "resumed");
        Ok(resumed)
    }

    /// Continue an existing session with a new user message (multi-turn).
    /// The full three-step plan re-runs over the existing context.
    pub async fn continue_session(&self, session_id: &str, message: &str) -> Result<Session, Error> {
        if message.trim().is_empty() {
            return Err(Error::Validation("message must not be blank".into()));
        }
        let session = self.find_or_not_found(session_id).await?;
        if session.status == SessionStatus::Running || session.status == SessionStatus::Paused {
            return Err(StoreError::Conflict(format!(
                "Session is still active, current status: {}",
                session.status
            ))
            .into());
        }

        self.context
            .append(&session, vec![ChatMessage::user(message)])
            .await?;
        let session = self
            .sessions
            .update_by_id(session.id, |s| {
                s.status = SessionStatus::Pending;
                s.result = None;
                s.error_message = None;
            })
            .await?;
        self.spawn_loop(session.clone());
        info!(session_id, "session continued");
        Ok(session)
    }

    /// Abort a session: FAILED("Aborted by user"), observed by the loop at
    /// its next iteration check. Idempotent no-op on terminal sessions.
    pub async fn abort(&self, session_id: &str) -> Result<Session, Error> {
        let session = self.find_or_not_found(session_id).await?;
        if session.is_terminal() {
            return Ok(session);
        }
        let aborted = self
            .sessions
            .update_by_id(session.id, |s| {
                s.status = SessionStatus::Failed;
                s.error_message = Some("Aborted by user".into());
            })
            .await?;
        self.publisher
            .publish(AgentEvent::status_change(session_id, "FAILED"));
        info!(session_id, "aborted");
        Ok(aborted)
    }

    /// Subscribe to the session's event topic (`/agent/{sessionId}`).
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<AgentEvent> {
        self.publisher.subscribe(session_id)
    }

    fn spawn_loop(&self, session: Session) {
        let agent_loop = self.agent_loop.clone();
        let session_id = session.session_id.clone();
        tokio::spawn(async move {
            agent_loop.run(session).await;
            // run() handles its own failures; this is the backstop log.
            info!(%session_id, "loop task finished");
        });
    }

    async fn find_or_not_found(&self, session_id: &str) -> Result<Session, StoreError> {
        match self.sessions.find_by_session_id(session_id).await {
            Ok(Some(session)) => Ok(session),
            Ok(None) => Err(StoreError::NotFound(format!("session not found: {session_id}"))),
            Err(e) => {
                warn!(session_id, error = %e, "session lookup failed");
                Err(e)
            }
        }
    }
}
