//! Session row persistence with optimistic versioning.
//!
//! Session rows are shared with external writers (pause/resume/abort
//! handlers race the loop). Every save checks-and-increments `version`;
//! a stale writer gets `StoreError::Conflict` instead of silently
//! clobbering newer state. `update_by_id` is the refetch-then-save helper
//! the loop uses before any mutation.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use agentforge_core::error::StoreError;
use agentforge_core::session::{Session, SessionStatus};

/// Conflict retries for `update_by_id` before surfacing the collision.
const SAVE_RETRIES: u32 = 3;

pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new PENDING session. `Conflict` when the external id is
    /// already taken.
    pub async fn create(
        &self,
        session_id: &str,
        user_id: Option<i64>,
        task_description: &str,
    ) -> Result<Session, StoreError> {
        if self.find_by_session_id(session_id).await?.is_some() {
            return Err(StoreError::Conflict(format!(
                "session already exists: {session_id}"
            )));
        }

        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT INTO agent_sessions
                (session_id, user_id, task_description, status, iteration_count, version, created_at, updated_at)
            VALUES (?1, ?2, ?3, 'PENDING', 0, 0, ?4, ?4)
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(task_description)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(format!("insert session: {e}")))?;

        debug!(session_id, id = result.last_insert_rowid(), "session created");
        self.find_by_id(result.last_insert_rowid())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("session vanished: {session_id}")))
    }

    pub async fn find_by_session_id(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query("SELECT * FROM agent_sessions WHERE session_id = ?1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Query(format!("find session: {e}")))?;
        row.map(|r| row_to_session(&r)).transpose()
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query("SELECT * FROM agent_sessions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Query(format!("find session by id: {e}")))?;
        row.map(|r| row_to_session(&r)).transpose()
    }

    /// Persist a session under the optimistic-version contract. The row
    /// is written only if its stored version still equals
    /// `session.version`; the returned session carries the new version.
    pub async fn save(&self, session: &Session) -> Result<Session, StoreError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE agent_sessions SET
                user_id = ?1,
                task_description = ?2,
                status = ?3,
                current_plan = ?4,
                context_window = ?5,
                iteration_count = ?6,
                result = ?7,
                error_message = ?8,
                version = version + 1,
                updated_at = ?9
            WHERE id = ?10 AND version = ?11
            "#,
        )
        .bind(session.user_id)
        .bind(&session.task_description)
        .bind(session.status.as_str())
        .bind(&session.current_plan)
        .bind(&session.context_window)
        .bind(session.iteration_count)
        .bind(&session.result)
        .bind(&session.error_message)
        .bind(&now)
        .bind(session.id)
        .bind(session.version)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(format!("save session: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "session {} version {} is stale",
                session.session_id, session.version
            )));
        }

        let mut saved = session.clone();
        saved.version += 1;
        saved.updated_at = Utc::now();
        Ok(saved)
    }

    /// Refetch-then-save: reload the current row by primary id, apply the
    /// mutation, and save; retried up to 3 times on version collisions.
    pub async fn update_by_id<F>(&self, id: i64, mutate: F) -> Result<Session, StoreError>
    where
        F: Fn(&mut Session),
    {
        let mut last_conflict = None;
        for _ in 0..SAVE_RETRIES {
            let mut session = self
                .find_by_id(id)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("session id {id}")))?;
            mutate(&mut session);
            match self.save(&session).await {
                Ok(saved) => return Ok(saved),
                Err(StoreError::Conflict(msg)) => {
                    debug!(id, "version collision on save, refetching");
                    last_conflict = Some(StoreError::Conflict(msg));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_conflict.unwrap_or_else(|| StoreError::Conflict(format!("session id {id}"))))
    }
}

fn row_to_session(row: &SqliteRow) -> Result<Session, StoreError> {
    let status_str: String = row
        .try_get("status")
        .map_err(|e| StoreError::Query(format!("status column: {e}")))?;
    let status: SessionStatus = status_str
        .parse()
        .map_err(|e: String| StoreError::Query(e))?;

    Ok(Session {
        id: row.try_get("id").map_err(|e| StoreError::Query(e.to_string()))?,
        user_id: row.try_get("user_id").map_err(|e| StoreError::Query(e.to_string()))?,
        session_id: row.try_get("session_id").map_err(|e| StoreError::Query(e.to_string()))?,
        task_description: row
            .try_get("task_description")
            .map_err(|e| StoreError::Query(e.to_string()))?,
        status,
        current_plan: row.try_get("current_plan").map_err(|e| StoreError::Query(e.to_string()))?,
        context_window: row
            .try_get("context_window")
            .map_err(|e| StoreError::Query(e.to_string()))?,
        iteration_count: row
            .try_get("iteration_count")
            .map_err(|e| StoreError::Query(e.to_string()))?,
        result: row.try_get("result").map_err(|e| StoreError::Query(e.to_string()))?,
        error_message: row
            .try_get("error_message")
            .map_err(|e| StoreError::Query(e.to_string()))?,
        version: row.try_get("version").map_err(|e| StoreError::Query(e.to_string()))?,
        created_at: parse_time(row, "created_at"),
        updated_at: parse_time(row, "updated_at"),
    })
}

fn parse_time(row: &SqliteRow, column: &str) -> DateTime<Utc> {
    row.try_get::<String, _>(column)
        .ok()
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SessionStore {
        SessionStore::new(crate::open("sqlite::memory:").await.unwrap())
    }

    #[tokio::test]
    async fn create_and_fetch() {
        let store = store().await;
        let session = store.create("s-1", Some(7), "solve it").await.unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.iteration_count, 0);
        assert_eq!(session.version, 0);

        let fetched = store.find_by_session_id("s-1").await.unwrap().unwrap();
        assert_eq!(fetched.id, session.id);
        assert_eq!(fetched.user_id, Some(7));
        assert_eq!(fetched.task_description, "solve it");

        assert!(store.find_by_session_id("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_session_id_conflicts() {
        let store = store().await;
        store.create("dup", None, "a").await.unwrap();
        let err = store.create("dup", None, "b").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn save_increments_version() {
        let store = store().await;
        let mut session = store.create("s", None, "task").await.unwrap();

        session.status = SessionStatus::Running;
        let saved = store.save(&session).await.unwrap();
        assert_eq!(saved.version, 1);

        let fetched = store.find_by_id(session.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, SessionStatus::Running);
        assert_eq!(fetched.version, 1);
    }

    #[tokio::test]
    async fn stale_save_conflicts() {
        let store = store().await;
        let session = store.create("s", None, "task").await.unwrap();

        // Two readers take the same version
        let mut first = session.clone();
        let mut second = session.clone();

        first.iteration_count = 1;
        store.save(&first).await.unwrap();

        second.iteration_count = 99;
        let err = store.save(&second).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // The first write won
        let fetched = store.find_by_id(session.id).await.unwrap().unwrap();
        assert_eq!(fetched.iteration_count, 1);
    }

    #[tokio::test]
    async fn update_by_id_survives_collisions() {
        let store = store().await;
        let session = store.create("s", None, "task").await.unwrap();

        // An external writer bumps the version between our fetch and save
        // by simply having written first; update_by_id refetches.
        store
            .update_by_id(session.id, |s| s.status = SessionStatus::Running)
            .await
            .unwrap();
        let updated = store
            .update_by_id(session.id, |s| s.iteration_count += 1)
            .await
            .unwrap();
        assert_eq!(updated.iteration_count, 1);
        assert_eq!(updated.status, SessionStatus::Running);
        assert_eq!(updated.version, 2);
    }

    #[tokio::test]
    async fn update_by_id_missing_session() {
        let store = store().await;
        let err = store.update_by_id(424242, |_| {}).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn full_field_roundtrip() {
        let store = store().await;
        let session = store.create("s", Some(1), "task").await.unwrap();

        store
            .update_by_id(session.id, |s| {
                s.status = SessionStatus::Completed;
                s.current_plan = Some(r#"["recall","think-and-act","answer"]"#.into());
                s.context_window = Some("[]".into());
                s.result = Some("42".into());
                s.iteration_count = 3;
            })
            .await
            .unwrap();

        let fetched = store.find_by_id(session.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, SessionStatus::Completed);
        assert_eq!(fetched.result.as_deref(), Some("42"));
        assert_eq!(fetched.current_plan.as_deref(), Some(r#"["recall","think-and-act","answer"]"#));
        assert!(fetched.is_terminal());
    }
}
