//! In-process vector store with brute-force cosine search.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use super::{MetadataFilter, PointRecord, ScoredPoint, VectorStore};
use crate::embeddings::cosine_similarity;
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Collection {
    dimensions: usize,
    keyword_indexes: HashSet<String>,
    points: Vec<PointRecord>,
}

/// Vector store that keeps every collection in memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of points stored in a collection (0 if absent).
    pub async fn point_count(&self, name: &str) -> usize {
        self.collections
            .read()
            .await
            .get(name)
            .map(|c| c.points.len())
            .unwrap_or(0)
    }

    /// Whether a keyword index was registered for `field`.
    pub async fn has_keyword_index(&self, name: &str, field: &str) -> bool {
        self.collections
            .read()
            .await
            .get(name)
            .is_some_and(|c| c.keyword_indexes.contains(field))
    }
}

fn missing(name: &str) -> StoreError {
    StoreError::Status {
        status: 404,
        body: format!("Collection `{name}` doesn't exist"),
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn collection_exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.collections.read().await.contains_key(name))
    }

    async fn create_collection(&self, name: &str, dimensions: usize) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        collections.entry(name.to_string()).or_insert_with(|| Collection {
            dimensions,
            ..Default::default()
        });
        Ok(())
    }

    async fn ensure_keyword_index(&self, name: &str, field: &str) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let collection = collections.get_mut(name).ok_or_else(|| missing(name))?;
        collection.keyword_indexes.insert(field.to_string());
        Ok(())
    }

    async fn upsert(&self, name: &str, points: Vec<PointRecord>) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let collection = collections.get_mut(name).ok_or_else(|| missing(name))?;
        if let Some(bad) = points.iter().find(|p| p.vector.len() != collection.dimensions) {
            return Err(StoreError::Dimension {
                expected: collection.dimensions,
                actual: bad.vector.len(),
            });
        }
        for point in points {
            match collection.points.iter_mut().find(|p| p.id == point.id) {
                Some(existing) => *existing = point,
                None => collection.points.push(point),
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredPoint>, StoreError> {
        let collections = self.collections.read().await;
        let collection = collections.get(name).ok_or_else(|| missing(name))?;

        let mut hits: Vec<ScoredPoint> = collection
            .points
            .iter()
            .filter(|p| filter.is_none_or(|f| f.matches(&p.payload)))
            .map(|p| ScoredPoint {
                id: p.id.to_string(),
                score: cosine_similarity(vector, &p.vector),
                payload: p.payload.clone(),
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }
}
