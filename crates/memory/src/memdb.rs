//! In-memory vector store.
//!
//! Used by tests and by deployments that run without a vector database.
//! Scoring is exact inner product over every row — fine for the volumes a
//! single process holds in memory.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use agentforge_core::error::MemoryError;

use crate::store::{matches_filter, tool_index_collection_name, SearchHit, VectorRow, VectorStore};

struct StoredRow {
    id: Value,
    fields: Map<String, Value>,
    vector: Vec<f32>,
}

struct Collection {
    dim: usize,
    /// Tool index collections key rows by `tool_id`; memory collections
    /// auto-assign int64 ids.
    string_pk: Option<String>,
    next_id: i64,
    rows: Vec<StoredRow>,
}

#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn project(row: &StoredRow, output_fields: &[&str]) -> Map<String, Value> {
        let mut entity = Map::new();
        entity.insert("id".into(), row.id.clone());
        for field in output_fields {
            if let Some(value) = row.fields.get(*field) {
                entity.insert((*field).to_string(), value.clone());
            }
        }
        entity
    }
}

fn inner_product(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| *x as f64 * *y as f64).sum()
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<bool, MemoryError> {
        let mut collections = self.collections.write();
        collections.entry(name.to_string()).or_insert_with(|| Collection {
            dim,
            string_pk: None,
            next_id: 1,
            rows: Vec::new(),
        });
        Ok(true)
    }

    async fn ensure_tool_index_collection(&self, dim: usize) -> Result<bool, MemoryError> {
        let name = tool_index_collection_name(dim);
        let mut collections = self.collections.write();
        collections.entry(name).or_insert_with(|| Collection {
            dim,
            string_pk: Some("tool_id".into()),
            next_id: 1,
            rows: Vec::new(),
        });
        Ok(true)
    }

    async fn insert(&self, collection: &str, row: VectorRow) -> Result<(), MemoryError> {
        let mut collections = self.collections.write();
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| MemoryError::Storage(format!("unknown collection: {collection}")))?;

        if row.vector.len() != coll.dim {
            return Err(MemoryError::DimensionMismatch {
                expected: coll.dim,
                actual: row.vector.len(),
            });
        }

        let id = match &coll.string_pk {
            Some(pk_field) => row
                .fields
                .get(pk_field)
                .cloned()
                .ok_or_else(|| MemoryError::Storage(format!("missing primary key field {pk_field}")))?,
            None => {
                let id = coll.next_id;
                coll.next_id += 1;
                Value::from(id)
            }
        };

        // String-keyed collections upsert on conflict.
        if coll.string_pk.is_some() {
            coll.rows.retain(|r| r.id != id);
        }

        coll.rows.push(StoredRow {
            id,
            fields: row.fields,
            vector: row.vector,
        });
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
        filter: Option<&str>,
        output_fields: &[&str],
    ) -> Result<Vec<SearchHit>, MemoryError> {
        let collections = self.collections.read();
        let coll = collections
            .get(collection)
            .ok_or_else(|| MemoryError::QueryFailed(format!("unknown collection: {collection}")))?;

        let mut hits: Vec<SearchHit> = coll
            .rows
            .iter()
            .filter(|row| filter.is_none_or(|f| matches_filter(&row.fields, f)))
            .map(|row| SearchHit {
                id: row.id.clone(),
                score: inner_product(&row.vector, vector),
                entity: Self::project(row, output_fields),
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn query(
        &self,
        collection: &str,
        filter: Option<&str>,
        output_fields: &[&str],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Map<String, Value>>, MemoryError> {
        let collections = self.collections.read();
        let coll = collections
            .get(collection)
            .ok_or_else(|| MemoryError::QueryFailed(format!("unknown collection: {collection}")))?;

        Ok(coll
            .rows
            .iter()
            .filter(|row| filter.is_none_or(|f| matches_filter(&row.fields, f)))
            .skip(offset)
            .take(limit)
            .map(|row| Self::project(row, output_fields))
            .collect())
    }

    async fn count(&self, collection: &str, filter: Option<&str>) -> Result<u64, MemoryError> {
        let collections = self.collections.read();
        let coll = collections
            .get(collection)
            .ok_or_else(|| MemoryError::QueryFailed(format!("unknown collection: {collection}")))?;

        Ok(coll
            .rows
            .iter()
            .filter(|row| filter.is_none_or(|f| matches_filter(&row.fields, f)))
            .count() as u64)
    }

    async fn delete_by_ids(&self, collection: &str, ids: &[Value]) -> Result<(), MemoryError> {
        let mut collections = self.collections.write();
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| MemoryError::Storage(format!("unknown collection: {collection}")))?;
        coll.rows.retain(|row| !ids.contains(&row.id));
        Ok(())
    }

    async fn delete_by_filter(&self, collection: &str, filter: &str) -> Result<(), MemoryError> {
        let mut collections = self.collections.write();
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| MemoryError::Storage(format!("unknown collection: {collection}")))?;
        coll.rows.retain(|row| !matches_filter(&row.fields, filter));
        Ok(())
    }
}
