//! User credential persistence: provider API keys and embedding model
//! configs.
//!
//! The default flag is slot-scoped: at most one active default per
//! (user, provider, purpose) for API keys, one default embedding model
//! per user. `set_default` clears the previous holder in the same
//! transaction, so the invariant holds under any call sequence.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use agentforge_core::error::StoreError;
use agentforge_core::keys::{
    ApiKeyStore, EmbeddingModelStore, KeyPurpose, NewEmbeddingModel, NewUserApiKey, UserApiKey,
};
use agentforge_core::memory::{derive_collection_name, EmbeddingModelConfig};

pub struct SqliteKeyStore {
    pool: SqlitePool,
}

impl SqliteKeyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_key(row: &SqliteRow) -> Result<UserApiKey, StoreError> {
    let purpose_str: String = row
        .try_get("purpose")
        .map_err(|e| StoreError::Query(e.to_string()))?;
    let purpose: KeyPurpose = purpose_str.parse().map_err(StoreError::Query)?;

    Ok(UserApiKey {
        id: row.try_get("id").map_err(|e| StoreError::Query(e.to_string()))?,
        user_id: row.try_get("user_id").map_err(|e| StoreError::Query(e.to_string()))?,
        provider: row.try_get("provider").map_err(|e| StoreError::Query(e.to_string()))?,
        purpose,
        key_value: row.try_get("key_value").map_err(|e| StoreError::Query(e.to_string()))?,
        base_url: row.try_get("base_url").map_err(|e| StoreError::Query(e.to_string()))?,
        model: row.try_get("model").map_err(|e| StoreError::Query(e.to_string()))?,
        is_default: row.try_get::<i64, _>("is_default").map_err(|e| StoreError::Query(e.to_string()))? != 0,
        is_active: row.try_get::<i64, _>("is_active").map_err(|e| StoreError::Query(e.to_string()))? != 0,
    })
}

fn row_to_model(row: &SqliteRow) -> Result<EmbeddingModelConfig, StoreError> {
    Ok(EmbeddingModelConfig {
        id: row.try_get("id").map_err(|e| StoreError::Query(e.to_string()))?,
        user_id: row.try_get("user_id").map_err(|e| StoreError::Query(e.to_string()))?,
        name: row.try_get("name").map_err(|e| StoreError::Query(e.to_string()))?,
        provider: row.try_get("provider").map_err(|e| StoreError::Query(e.to_string()))?,
        model_name: row.try_get("model_name").map_err(|e| StoreError::Query(e.to_string()))?,
        api_key: row.try_get("api_key").map_err(|e| StoreError::Query(e.to_string()))?,
        base_url: row.try_get("base_url").map_err(|e| StoreError::Query(e.to_string()))?,
        dimension: row.try_get::<i64, _>("dimension").map_err(|e| StoreError::Query(e.to_string()))? as usize,
        collection_name: row
            .try_get("collection_name")
            .map_err(|e| StoreError::Query(e.to_string()))?,
        max_tokens: row.try_get::<i64, _>("max_tokens").map_err(|e| StoreError::Query(e.to_string()))? as u32,
        is_default: row.try_get::<i64, _>("is_default").map_err(|e| StoreError::Query(e.to_string()))? != 0,
        is_active: row.try_get::<i64, _>("is_active").map_err(|e| StoreError::Query(e.to_string()))? != 0,
    })
}

#[async_trait]
impl ApiKeyStore for SqliteKeyStore {
    async fn insert(&self, key: NewUserApiKey) -> Result<UserApiKey, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Query(format!("begin: {e}")))?;

        if key.is_default {
            sqlx::query(
                "UPDATE user_api_keys SET is_default = 0 WHERE user_id = ?1 AND provider = ?2 AND purpose = ?3",
            )
            .bind(key.user_id)
            .bind(&key.provider)
            .bind(key.purpose.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Query(format!("clear defaults: {e}")))?;
        }

        let result = sqlx::query(
            r#"
            INSERT INTO user_api_keys (user_id, provider, purpose, key_value, base_url, model, is_default, is_active)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)
            "#,
        )
        .bind(key.user_id)
        .bind(&key.provider)
        .bind(key.purpose.as_str())
        .bind(&key.key_value)
        .bind(&key.base_url)
        .bind(&key.model)
        .bind(key.is_default as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Query(format!("insert key: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(format!("commit: {e}")))?;

        let id = result.last_insert_rowid();
        debug!(user_id = key.user_id, provider = %key.provider, id, "api key stored");

        let row = sqlx::query("SELECT * FROM user_api_keys WHERE id = ?1")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Query(format!("reload key: {e}")))?;
        row_to_key(&row)
    }

    async fn active_keys(&self, user_id: i64) -> Result<Vec<UserApiKey>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM user_api_keys WHERE user_id = ?1 AND is_active = 1 ORDER BY is_default DESC, id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(format!("list keys: {e}")))?;
        rows.iter().map(row_to_key).collect()
    }

    async fn set_default(&self, user_id: i64, key_id: i64) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Query(format!("begin: {e}")))?;

        let row = sqlx::query(
            "SELECT provider, purpose FROM user_api_keys WHERE id = ?1 AND user_id = ?2",
        )
        .bind(key_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Query(format!("find key: {e}")))?
        .ok_or_else(|| StoreError::NotFound(format!("api key {key_id}")))?;

        let provider: String = row.try_get("provider").map_err(|e| StoreError::Query(e.to_string()))?;
        let purpose: String = row.try_get("purpose").map_err(|e| StoreError::Query(e.to_string()))?;

        // Clear the slot, then claim it. Re-running on the current default
        // is a harmless no-op.
        sqlx::query(
            "UPDATE user_api_keys SET is_default = 0 WHERE user_id = ?1 AND provider = ?2 AND purpose = ?3",
        )
        .bind(user_id)
        .bind(&provider)
        .bind(&purpose)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Query(format!("clear defaults: {e}")))?;

        sqlx::query("UPDATE user_api_keys SET is_default = 1 WHERE id = ?1")
            .bind(key_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Query(format!("set default: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(format!("commit: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl EmbeddingModelStore for SqliteKeyStore {
    async fn insert(&self, model: NewEmbeddingModel) -> Result<EmbeddingModelConfig, StoreError> {
        let collection_name = derive_collection_name(&model.model_name, model.dimension);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Query(format!("begin: {e}")))?;

        if model.is_default {
            sqlx::query("UPDATE user_embedding_models SET is_default = 0 WHERE user_id = ?1")
                .bind(model.user_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Query(format!("clear defaults: {e}")))?;
        }

        let result = sqlx::query(
            r#"
            INSERT INTO user_embedding_models
                (user_id, name, provider, model_name, api_key, base_url, dimension, collection_name, max_tokens, is_default, is_active)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1)
            "#,
        )
        .bind(model.user_id)
        .bind(&model.name)
        .bind(&model.provider)
        .bind(&model.model_name)
        .bind(&model.api_key)
        .bind(&model.base_url)
        .bind(model.dimension as i64)
        .bind(&collection_name)
        .bind(model.max_tokens as i64)
        .bind(model.is_default as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Query(format!("insert model: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(format!("commit: {e}")))?;

        let row = sqlx::query("SELECT * FROM user_embedding_models WHERE id = ?1")
            .bind(result.last_insert_rowid())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Query(format!("reload model: {e}")))?;
        row_to_model(&row)
    }

    async fn find_default(&self, user_id: i64) -> Result<Option<EmbeddingModelConfig>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM user_embedding_models WHERE user_id = ?1 AND is_default = 1 AND is_active = 1 LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Query(format!("find default model: {e}")))?;
        row.map(|r| row_to_model(&r)).transpose()
    }

    async fn set_default(&self, user_id: i64, model_id: i64) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Query(format!("begin: {e}")))?;

        let exists = sqlx::query("SELECT id FROM user_embedding_models WHERE id = ?1 AND user_id = ?2")
            .bind(model_id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Query(format!("find model: {e}")))?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!("embedding model {model_id}")));
        }

        sqlx::query("UPDATE user_embedding_models SET is_default = 0 WHERE user_id = ?1")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Query(format!("clear defaults: {e}")))?;

        sqlx::query("UPDATE user_embedding_models SET is_default = 1 WHERE id = ?1")
            .bind(model_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Query(format!("set default: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(format!("commit: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteKeyStore {
        SqliteKeyStore::new(crate::open("sqlite::memory:").await.unwrap())
    }

    fn new_key(user_id: i64, provider: &str, purpose: KeyPurpose, is_default: bool) -> NewUserApiKey {
        NewUserApiKey {
            user_id,
            provider: provider.into(),
            purpose,
            key_value: "sk-test".into(),
            base_url: None,
            model: None,
            is_default,
        }
    }

    async fn defaults_in_slot(store: &SqliteKeyStore, user: i64, provider: &str, purpose: KeyPurpose) -> usize {
        ApiKeyStore::active_keys(store, user)
            .await
            .unwrap()
            .iter()
            .filter(|k| k.provider == provider && k.purpose == purpose && k.is_default)
            .count()
    }

    #[tokio::test]
    async fn at_most_one_default_per_slot() {
        let store = store().await;

        // Any sequence of inserts and set_defaults leaves ≤1 default
        let a = ApiKeyStore::insert(&store, new_key(1, "openai", KeyPurpose::Llm, true))
            .await
            .unwrap();
        let b = ApiKeyStore::insert(&store, new_key(1, "openai", KeyPurpose::Llm, true))
            .await
            .unwrap();
        assert_eq!(defaults_in_slot(&store, 1, "openai", KeyPurpose::Llm).await, 1);

        ApiKeyStore::set_default(&store, 1, a.id).await.unwrap();
        assert_eq!(defaults_in_slot(&store, 1, "openai", KeyPurpose::Llm).await, 1);

        // Idempotent: setting the current default again changes nothing
        ApiKeyStore::set_default(&store, 1, a.id).await.unwrap();
        assert_eq!(defaults_in_slot(&store, 1, "openai", KeyPurpose::Llm).await, 1);

        ApiKeyStore::set_default(&store, 1, b.id).await.unwrap();
        let keys = ApiKeyStore::active_keys(&store, 1).await.unwrap();
        assert!(keys.iter().find(|k| k.id == b.id).unwrap().is_default);
        assert!(!keys.iter().find(|k| k.id == a.id).unwrap().is_default);
    }

    #[tokio::test]
    async fn slots_are_independent() {
        let store = store().await;
        ApiKeyStore::insert(&store, new_key(1, "openai", KeyPurpose::Llm, true))
            .await
            .unwrap();
        ApiKeyStore::insert(&store, new_key(1, "openai", KeyPurpose::Embedding, true))
            .await
            .unwrap();
        ApiKeyStore::insert(&store, new_key(1, "deepseek", KeyPurpose::Llm, true))
            .await
            .unwrap();

        // Three different slots, three defaults, no interference
        assert_eq!(defaults_in_slot(&store, 1, "openai", KeyPurpose::Llm).await, 1);
        assert_eq!(defaults_in_slot(&store, 1, "openai", KeyPurpose::Embedding).await, 1);
        assert_eq!(defaults_in_slot(&store, 1, "deepseek", KeyPurpose::Llm).await, 1);
    }

    #[tokio::test]
    async fn active_keys_orders_defaults_first() {
        let store = store().await;
        ApiKeyStore::insert(&store, new_key(1, "openai", KeyPurpose::Llm, false))
            .await
            .unwrap();
        ApiKeyStore::insert(&store, new_key(1, "deepseek", KeyPurpose::Llm, true))
            .await
            .unwrap();

        let keys = ApiKeyStore::active_keys(&store, 1).await.unwrap();
        assert!(keys[0].is_default);
        assert_eq!(keys[0].provider, "deepseek");
    }

    #[tokio::test]
    async fn set_default_on_missing_key() {
        let store = store().await;
        let err = ApiKeyStore::set_default(&store, 1, 999).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn embedding_model_collection_is_derived() {
        let store = store().await;
        let model = EmbeddingModelStore::insert(
            &store,
            NewEmbeddingModel {
                user_id: 1,
                name: "local".into(),
                provider: "ollama".into(),
                model_name: "nomic-embed-text".into(),
                api_key: None,
                base_url: "http://localhost:11434/v1".into(),
                dimension: 768,
                max_tokens: 8192,
                is_default: true,
            },
        )
        .await
        .unwrap();
        assert_eq!(model.collection_name, "memories_nomic_embed_text_768");

        let found = EmbeddingModelStore::find_default(&store, 1).await.unwrap().unwrap();
        assert_eq!(found.id, model.id);
        assert_eq!(found.dimension, 768);
    }

    #[tokio::test]
    async fn one_default_embedding_model_per_user() {
        let store = store().await;
        let first = EmbeddingModelStore::insert(
            &store,
            NewEmbeddingModel {
                user_id: 1,
                name: "a".into(),
                provider: "openai".into(),
                model_name: "text-embedding-3-small".into(),
                api_key: Some("sk".into()),
                base_url: "https://api.openai.com/v1".into(),
                dimension: 1536,
                max_tokens: 8192,
                is_default: true,
            },
        )
        .await
        .unwrap();
        let second = EmbeddingModelStore::insert(
            &store,
            NewEmbeddingModel {
                user_id: 1,
                name: "b".into(),
                provider: "ollama".into(),
                model_name: "bge-m3".into(),
                api_key: None,
                base_url: "http://localhost:11434/v1".into(),
                dimension: 1024,
                max_tokens: 8192,
                is_default: true,
            },
        )
        .await
        .unwrap();

        let found = EmbeddingModelStore::find_default(&store, 1).await.unwrap().unwrap();
        assert_eq!(found.id, second.id);

        EmbeddingModelStore::set_default(&store, 1, first.id).await.unwrap();
        let found = EmbeddingModelStore::find_default(&store, 1).await.unwrap().unwrap();
        assert_eq!(found.id, first.id);
    }
}
