//! Vector index abstraction.
//!
//! The index is an opaque nearest-neighbor service: named collections of
//! points, each point a vector plus a JSON payload, searchable by cosine
//! similarity with optional equality filters on payload fields.

mod memory;
mod qdrant;

pub use memory::InMemoryStore;
pub use qdrant::QdrantStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::StoreError;

/// A point to be written to a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointRecord {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: Value,
}

/// A search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: Value,
}

/// One equality condition on a payload path such as `metadata.session_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMatch {
    pub key: String,
    pub value: String,
}

/// Conjunction of equality conditions; every condition must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFilter {
    pub must: Vec<FieldMatch>,
}

impl MetadataFilter {
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            must: vec![FieldMatch {
                key: key.into(),
                value: value.into(),
            }],
        }
    }

    /// Render in the Qdrant filter wire format.
    pub fn to_qdrant(&self) -> Value {
        let must: Vec<Value> = self
            .must
            .iter()
            .map(|m| serde_json::json!({"key": m.key, "match": {"value": m.value}}))
            .collect();
        serde_json::json!({ "must": must })
    }

    /// Evaluate the filter against a payload. A missing field never matches.
    pub fn matches(&self, payload: &Value) -> bool {
        self.must.iter().all(|m| {
            lookup_path(payload, &m.key)
                .and_then(Value::as_str)
                .is_some_and(|v| v == m.value)
        })
    }
}

/// Resolve a dotted path (`metadata.session_id`) inside a JSON payload.
pub fn lookup_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(payload, |node, key| node.get(key))
}

/// Trait for vector index backends.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn collection_exists(&self, name: &str) -> Result<bool, StoreError>;

    /// Create a collection with the given vector size and cosine distance.
    async fn create_collection(&self, name: &str, dimensions: usize) -> Result<(), StoreError>;

    /// Ensure a keyword payload index exists on `field`. Idempotent.
    async fn ensure_keyword_index(&self, name: &str, field: &str) -> Result<(), StoreError>;

    async fn upsert(&self, name: &str, points: Vec<PointRecord>) -> Result<(), StoreError>;

    /// Nearest neighbors ordered by descending similarity, at most `limit` of them.
    async fn search(
        &self,
        name: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredPoint>, StoreError>;

    /// Create the collection unless it already exists. Returns whether it was created.
    async fn ensure_collection(&self, name: &str, dimensions: usize) -> Result<bool, StoreError> {
        if self.collection_exists(name).await? {
            return Ok(false);
        }
        self.create_collection(name, dimensions).await?;
        Ok(true)
    }
}

/// Build the configured vector store backend.
pub fn create_store(config: &StoreConfig) -> Result<Arc<dyn VectorStore>, StoreError> {
    match config.provider.as_str() {
        "memory" => Ok(Arc::new(InMemoryStore::new())),
        "qdrant" => Ok(Arc::new(QdrantStore::new(config)?)),
        other => Err(StoreError::Request {
            message: format!("unknown vector store provider '{other}'"),
        }),
    }
}
