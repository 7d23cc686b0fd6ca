//! Per-session agent events and the broadcast publisher.
//!
//! Every event the agent emits — a thinking token, a tool call, a final
//! answer — is wrapped in the `AgentEvent` envelope and pushed to the
//! session's topic. Delivery is fire-and-forget: a publish never blocks
//! or fails the loop.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Classifies every event the agent emits.
///
/// Flow: PLAN_READY → STEP_START(1) → STEP_COMPLETE(1) → STEP_START(2) →
/// … → STEP_COMPLETE(n) → FINAL_ANSWER.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Execution plan (step titles) for this session. payload = [String].
    PlanReady,
    /// A step is starting. payload = step index + title.
    StepStart,
    /// A step finished. payload = step index + title + optional summary.
    StepComplete,
    /// A single token from the streaming LLM (during step 2).
    Thinking,
    /// The agent is about to invoke a tool. payload = ToolCall.
    ToolCall,
    /// A tool has returned. payload = {toolName, output}.
    ToolResult,
    /// A new reasoning iteration inside think-and-act.
    IterationStart,
    /// Final answer; session complete.
    FinalAnswer,
    /// Session status changed (e.g. RUNNING → PAUSED).
    StatusChange,
    /// Unrecoverable error. content = message.
    Error,
}

/// The single event envelope broadcast to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub session_id: String,

    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Free-form text (token for THINKING, answer for FINAL_ANSWER, error
    /// message for ERROR).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Structured object for rich events; None for token-level events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    /// Which reasoning iteration produced this event.
    pub iteration: i32,

    /// Epoch millis; useful for latency measurement on the client.
    pub timestamp: i64,
}

/// `{index, title, summary?}` payload for step events, camelCased on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepPayload {
    pub step_index: u32,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// `{toolName, output}` payload for TOOL_RESULT events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultPayload {
    pub tool_name: String,
    pub output: String,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl AgentEvent {
    fn new(
        session_id: &str,
        event_type: EventType,
        content: Option<String>,
        payload: Option<serde_json::Value>,
        iteration: i32,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            event_type,
            content,
            payload,
            iteration,
            timestamp: now_ms(),
        }
    }

    pub fn plan_ready(session_id: &str, steps: &[&str]) -> Self {
        let payload = serde_json::json!(steps);
        Self::new(session_id, EventType::PlanReady, None, Some(payload), 0)
    }

    pub fn step_start(session_id: &str, step_index: u32, title: &str) -> Self {
        let payload = StepPayload {
            step_index,
            title: title.to_string(),
            summary: None,
        };
        Self::new(
            session_id,
            EventType::StepStart,
            None,
            serde_json::to_value(payload).ok(),
            0,
        )
    }

    pub fn step_complete(session_id: &str, step_index: u32, title: &str, summary: &str) -> Self {
        let payload = StepPayload {
            step_index,
            title: title.to_string(),
            summary: Some(summary.to_string()),
        };
        Self::new(
            session_id,
            EventType::StepComplete,
            Some(summary.to_string()),
            serde_json::to_value(payload).ok(),
            0,
        )
    }

    pub fn thinking(session_id: &str, token: &str, iteration: i32) -> Self {
        Self::new(session_id, EventType::Thinking, Some(token.to_string()), None, iteration)
    }

    pub fn iteration_start(session_id: &str, iteration: i32) -> Self {
        Self::new(session_id, EventType::IterationStart, None, None, iteration)
    }

    pub fn tool_call(session_id: &str, call: &crate::message::ToolCall, iteration: i32) -> Self {
        Self::new(
            session_id,
            EventType::ToolCall,
            None,
            serde_json::to_value(call).ok(),
            iteration,
        )
    }

    pub fn tool_result(session_id: &str, tool_name: &str, output: &str, iteration: i32) -> Self {
        let payload = ToolResultPayload {
            tool_name: tool_name.to_string(),
            output: output.to_string(),
        };
        Self::new(
            session_id,
            EventType::ToolResult,
            Some(output.to_string()),
            serde_json::to_value(payload).ok(),
            iteration,
        )
    }

    pub fn final_answer(session_id: &str, answer: &str, iteration: i32) -> Self {
        Self::new(session_id, EventType::FinalAnswer, Some(answer.to_string()), None, iteration)
    }

    pub fn status_change(session_id: &str, new_status: &str) -> Self {
        Self::new(session_id, EventType::StatusChange, Some(new_status.to_string()), None, 0)
    }

    pub fn error(session_id: &str, message: &str, iteration: i32) -> Self {
        Self::new(session_id, EventType::Error, Some(message.to_string()), None, iteration)
    }
}

/// Per-session broadcast topics.
///
/// Topic layout: `/agent/{sessionId}` → all events for one session.
/// Subscribers observe a session's events in publish order; nothing is
/// guaranteed across sessions. Lagging subscribers drop old events rather
/// than blocking the loop.
pub struct EventPublisher {
    capacity: usize,
    topics: RwLock<HashMap<String, broadcast::Sender<AgentEvent>>>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// The topic path for a session, as a subscriber would address it.
    pub fn topic(session_id: &str) -> String {
        format!("/agent/{session_id}")
    }

    /// Publish an event to all subscribers of its session.
    /// Fire-and-forget — the caller is never blocked and never fails.
    pub fn publish(&self, event: AgentEvent) {
        let sender = self.sender_for(&event.session_id);
        if let Err(e) = sender.send(event) {
            // No subscribers yet (or all dropped) — that's fine.
            debug!("event publish with no subscribers: {e}");
        }
    }

    /// Subscribe to a session's topic.
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<AgentEvent> {
        self.sender_for(session_id).subscribe()
    }

    fn sender_for(&self, session_id: &str) -> broadcast::Sender<AgentEvent> {
        if let Some(sender) = self.topics.read().unwrap().get(session_id) {
            return sender.clone();
        }
        let mut topics = self.topics.write().unwrap();
        topics
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Drop a finished session's topic.
    pub fn remove_topic(&self, session_id: &str) {
        self.topics.write().unwrap().remove(session_id);
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}
