//! SQLite persistence for AgentForge.
//!
//! One pool, four stores: sessions (optimistic versioning), context
//! windows (layered on the session store), user credentials, and the tool
//! catalog. Schema migrations run inline at open.

pub mod context;
pub mod keys;
pub mod session;
pub mod tools;

pub use context::ContextStore;
pub use keys::SqliteKeyStore;
pub use session::SessionStore;
pub use tools::SqliteToolStore;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

use agentforge_core::error::StoreError;

/// Open (or create) the database and run all migrations.
///
/// Pass `"sqlite::memory:"` for an ephemeral database in tests.
pub async fn open(url: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(url)
        .map_err(|e| StoreError::Unavailable(format!("invalid SQLite url: {e}")))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .pragma("foreign_keys", "ON");

    // In-memory databases are per-connection; a pool of one keeps a single
    // coherent database for tests.
    let max_connections = if url.contains(":memory:") { 1 } else { 4 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(|e| StoreError::Unavailable(format!("failed to open SQLite: {e}")))?;

    run_migrations(&pool).await?;
    info!(url, "database opened");
    Ok(pool)
}

async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
    for statement in [
        r#"
        CREATE TABLE IF NOT EXISTS agent_sessions (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id       TEXT UNIQUE NOT NULL,
            user_id          INTEGER,
            task_description TEXT NOT NULL,
            status           TEXT NOT NULL,
            current_plan     TEXT,
            context_window   TEXT,
            iteration_count  INTEGER NOT NULL DEFAULT 0,
            result           TEXT,
            error_message    TEXT,
            version          INTEGER NOT NULL DEFAULT 0,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS user_api_keys (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id    INTEGER NOT NULL,
            provider   TEXT NOT NULL,
            purpose    TEXT NOT NULL,
            key_value  TEXT NOT NULL,
            base_url   TEXT,
            model      TEXT,
            is_default INTEGER NOT NULL DEFAULT 0,
            is_active  INTEGER NOT NULL DEFAULT 1
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS user_embedding_models (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id         INTEGER NOT NULL,
            name            TEXT NOT NULL,
            provider        TEXT NOT NULL,
            model_name      TEXT NOT NULL,
            api_key         TEXT,
            base_url        TEXT NOT NULL,
            dimension       INTEGER NOT NULL,
            collection_name TEXT NOT NULL,
            max_tokens      INTEGER NOT NULL DEFAULT 8192,
            is_default      INTEGER NOT NULL DEFAULT 0,
            is_active       INTEGER NOT NULL DEFAULT 1
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS agent_tools (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            tool_name        TEXT UNIQUE NOT NULL,
            tool_description TEXT NOT NULL,
            input_schema     TEXT NOT NULL,
            tool_kind        TEXT NOT NULL,
            script_content   TEXT,
            entry_point      TEXT,
            is_active        INTEGER NOT NULL DEFAULT 1
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_sessions_session_id ON agent_sessions(session_id)",
        "CREATE INDEX IF NOT EXISTS idx_keys_user ON user_api_keys(user_id, provider, purpose)",
        "CREATE INDEX IF NOT EXISTS idx_embedding_models_user ON user_embedding_models(user_id)",
    ] {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migration failed: {e}")))?;
    }
    Ok(())
}
