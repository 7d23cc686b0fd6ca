//! Agent session — one end-to-end autonomous execution of a user task.
//!
//! The entire cognitive state of the agent lives in this row — the process
//! itself is intentionally stateless. A crash or rolling restart at any
//! point is recovered by reloading the row and re-entering the loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a session.
///
/// PENDING → RUNNING → {PAUSED ⇄ RUNNING} → COMPLETED | FAILED.
/// COMPLETED and FAILED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// One agent session row.
///
/// `context_window` holds the serialized `Vec<ChatMessage>` sent to the LLM
/// on every iteration; `current_plan` the serialized step titles. Both are
/// JSON blobs so external readers can render them without extra queries.
///
/// `version` backs optimistic locking: every save checks-and-increments it,
/// so stale writers (the loop racing a pause/abort handler) are detected
/// instead of silently overwriting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Database primary key.
    pub id: i64,

    /// Owner of this session (nullable for system-submitted tasks).
    pub user_id: Option<i64>,

    /// External opaque id passed in by the caller (≤64 chars).
    pub session_id: String,

    /// The original task the user asked the agent to solve.
    pub task_description: String,

    pub status: SessionStatus,

    /// JSON-serialized plan step titles. None until the plan is published.
    pub current_plan: Option<String>,

    /// JSON-serialized conversation history.
    pub context_window: Option<String>,

    /// Monotonically incremented each loop iteration; safety breaker
    /// against cycles.
    pub iteration_count: i32,

    /// Populated when status = COMPLETED.
    pub result: Option<String>,

    /// Populated when status = FAILED.
    pub error_message: Option<String>,

    /// Optimistic-lock counter.
    pub version: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for s in [
            SessionStatus::Pending,
            SessionStatus::Running,
            SessionStatus::Paused,
            SessionStatus::Completed,
            SessionStatus::Failed,
        ] {
            let parsed: SessionStatus = s.as_str().parse().unwrap();
            assert_eq!(parsed, s);
        }
        assert!("NOPE".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
        assert!(!SessionStatus::Pending.is_terminal());
    }

    #[test]
    fn status_serializes_screaming() {
        let json = serde_json::to_string(&SessionStatus::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
    }
}
