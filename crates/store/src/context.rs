//! The session's context window — the ordered message list sent to the
//! LLM on every iteration.
//!
//! The context lives in the session row as a JSON blob, so any restart
//! picks up exactly where the loop left off. Persistence always reloads
//! the row by primary id (never trusts the possibly-stale reference in
//! hand), preserving the optimistic-version contract.

use std::sync::Arc;

use tracing::{debug, error};

use agentforge_core::error::StoreError;
use agentforge_core::message::{ChatMessage, Role};
use agentforge_core::session::Session;

use crate::session::SessionStore;

pub struct ContextStore {
    sessions: Arc<SessionStore>,
    /// Sliding-window ceiling on the number of messages.
    max_messages: usize,
}

impl ContextStore {
    pub fn new(sessions: Arc<SessionStore>, max_messages: usize) -> Self {
        Self {
            sessions,
            max_messages,
        }
    }

    /// Deserialize the current context window. Empty when the context has
    /// not been initialized yet (or the blob is corrupt — better to start
    /// clean than to wedge the session).
    pub fn load(&self, session: &Session) -> Vec<ChatMessage> {
        let Some(blob) = session.context_window.as_deref().filter(|s| !s.trim().is_empty()) else {
            return Vec::new();
        };
        match serde_json::from_str(blob) {
            Ok(messages) => messages,
            Err(e) => {
                error!(session_id = %session.session_id, error = %e, "failed to deserialize context");
                Vec::new()
            }
        }
    }

    /// Replace the entire context window (used when initializing with the
    /// system prompt and first user message).
    pub async fn initialize(
        &self,
        session: &Session,
        messages: Vec<ChatMessage>,
    ) -> Result<(), StoreError> {
        let mut context = messages;
        self.trim(&mut context);
        self.persist(session, &context).await
    }

    /// Append messages and persist. The trim keeps growth bounded.
    pub async fn append(
        &self,
        session: &Session,
        messages: Vec<ChatMessage>,
    ) -> Result<(), StoreError> {
        // Work from the freshest copy of the blob, not the caller's.
        let current = self
            .sessions
            .find_by_id(session.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("session {}", session.session_id)))?;
        let mut context = self.load(&current);
        context.extend(messages);
        self.trim(&mut context);
        self.persist(session, &context).await
    }

    /// Sliding-window trim: keep the system prompt (first message iff
    /// role=system), then the most recent messages, so the agent never
    /// loses its persona.
    fn trim(&self, context: &mut Vec<ChatMessage>) {
        if context.len() <= self.max_messages {
            return;
        }

        let system_prompt = context
            .first()
            .filter(|m| m.role == Role::System)
            .cloned();

        let keep_tail = self.max_messages - usize::from(system_prompt.is_some());
        let tail_start = context.len() - keep_tail;
        let mut trimmed: Vec<ChatMessage> = context.split_off(tail_start);

        if let Some(system) = system_prompt {
            trimmed.insert(0, system);
        }

        *context = trimmed;
        debug!(len = context.len(), "context trimmed");
    }

    async fn persist(&self, session: &Session, context: &[ChatMessage]) -> Result<(), StoreError> {
        let blob = serde_json::to_string(context)
            .map_err(|e| StoreError::Query(format!("serialize context: {e}")))?;
        self.sessions
            .update_by_id(session.id, move |s| s.context_window = Some(blob.clone()))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup(max: usize) -> (Arc<SessionStore>, ContextStore, Session) {
        let pool = crate::open("sqlite::memory:").await.unwrap();
        let sessions = Arc::new(SessionStore::new(pool));
        let context = ContextStore::new(sessions.clone(), max);
        let session = sessions.create("s", None, "task").await.unwrap();
        (sessions, context, session)
    }

    #[tokio::test]
    async fn load_empty_context() {
        let (_, context, session) = setup(50).await;
        assert!(context.load(&session).is_empty());
    }

    #[tokio::test]
    async fn initialize_then_load() {
        let (sessions, context, session) = setup(50).await;
        context
            .initialize(
                &session,
                vec![ChatMessage::system("persona"), ChatMessage::user("task")],
            )
            .await
            .unwrap();

        let fresh = sessions.find_by_id(session.id).await.unwrap().unwrap();
        let loaded = context.load(&fresh);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].role, Role::System);
        assert_eq!(loaded[1].content.as_deref(), Some("task"));
    }

    #[tokio::test]
    async fn append_accumulates_in_order() {
        let (sessions, context, session) = setup(50).await;
        context
            .initialize(&session, vec![ChatMessage::system("sys")])
            .await
            .unwrap();
        context
            .append(&session, vec![ChatMessage::user("one")])
            .await
            .unwrap();
        context
            .append(
                &session,
                vec![ChatMessage::assistant_text("two"), ChatMessage::user("three")],
            )
            .await
            .unwrap();

        let fresh = sessions.find_by_id(session.id).await.unwrap().unwrap();
        let loaded = context.load(&fresh);
        let contents: Vec<_> = loaded.iter().filter_map(|m| m.content.as_deref()).collect();
        assert_eq!(contents, vec!["sys", "one", "two", "three"]);
    }

    #[tokio::test]
    async fn append_works_from_stale_reference() {
        let (sessions, context, session) = setup(50).await;
        context
            .initialize(&session, vec![ChatMessage::user("a")])
            .await
            .unwrap();
        // `session` still has the pre-initialize blob (None); append must
        // not lose "a"
        context
            .append(&session, vec![ChatMessage::user("b")])
            .await
            .unwrap();

        let fresh = sessions.find_by_id(session.id).await.unwrap().unwrap();
        assert_eq!(context.load(&fresh).len(), 2);
    }

    #[tokio::test]
    async fn trim_preserves_system_prompt() {
        let (sessions, context, session) = setup(5).await;
        let mut messages = vec![ChatMessage::system("persona")];
        for i in 0..10 {
            messages.push(ChatMessage::user(format!("m{i}")));
        }
        context.initialize(&session, messages).await.unwrap();

        let fresh = sessions.find_by_id(session.id).await.unwrap().unwrap();
        let loaded = context.load(&fresh);
        assert_eq!(loaded.len(), 5);
        assert_eq!(loaded[0].role, Role::System);
        assert_eq!(loaded[0].content.as_deref(), Some("persona"));
        // tail is the most recent messages
        assert_eq!(loaded[4].content.as_deref(), Some("m9"));
        assert_eq!(loaded[1].content.as_deref(), Some("m6"));
    }

    #[tokio::test]
    async fn trim_without_system_prompt_keeps_tail() {
        let (sessions, context, session) = setup(3).await;
        let messages: Vec<_> = (0..8).map(|i| ChatMessage::user(format!("m{i}"))).collect();
        context.initialize(&session, messages).await.unwrap();

        let fresh = sessions.find_by_id(session.id).await.unwrap().unwrap();
        let loaded = context.load(&fresh);
        let contents: Vec<_> = loaded.iter().filter_map(|m| m.content.as_deref()).collect();
        assert_eq!(contents, vec!["m5", "m6", "m7"]);
    }

    #[tokio::test]
    async fn repeated_appends_never_exceed_ceiling() {
        let (sessions, context, session) = setup(6).await;
        context
            .initialize(&session, vec![ChatMessage::system("sys")])
            .await
            .unwrap();

        for i in 0..25 {
            context
                .append(&session, vec![ChatMessage::user(format!("m{i}"))])
                .await
                .unwrap();
            let fresh = sessions.find_by_id(session.id).await.unwrap().unwrap();
            let loaded = context.load(&fresh);
            assert!(loaded.len() <= 6);
            assert_eq!(loaded[0].role, Role::System, "system prompt must survive trim");
        }
    }

    #[tokio::test]
    async fn corrupt_blob_loads_as_empty() {
        let (sessions, context, session) = setup(50).await;
        sessions
            .update_by_id(session.id, |s| s.context_window = Some("{not valid".into()))
            .await
            .unwrap();
        let fresh = sessions.find_by_id(session.id).await.unwrap().unwrap();
        assert!(context.load(&fresh).is_empty());
    }
}
