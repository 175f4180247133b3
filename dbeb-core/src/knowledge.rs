//! Knowledge store gateway.
//!
//! Pairs an [`Embedder`] with a [`VectorStore`] and exposes the two logical
//! collections: the global knowledge base and the session-scoped one. Every
//! chunk written to the session collection carries `metadata.session_id`, and
//! every session search filters on it at the storage level.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::embeddings::Embedder;
use crate::error::StoreError;
use crate::splitter::DocumentChunk;
use crate::store::{MetadataFilter, PointRecord, VectorStore};

/// Which logical collection an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Global,
    Session,
}

/// A retrieved chunk with its similarity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub text: String,
    pub score: f32,
    pub metadata: Map<String, Value>,
}

/// Outcome of [`KnowledgeGateway::provision`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionReport {
    pub created: Vec<String>,
    pub existing: Vec<String>,
    pub failures: Vec<String>,
}

impl ProvisionReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Embedding plus vector storage behind one handle.
pub struct KnowledgeGateway {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    config: StoreConfig,
}

impl KnowledgeGateway {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>, config: StoreConfig) -> Self {
        Self {
            embedder,
            store,
            config,
        }
    }

    pub fn collection_name(&self, collection: Collection) -> &str {
        match collection {
            Collection::Global => &self.config.global_collection,
            Collection::Session => &self.config.session_collection,
        }
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Ensure both collections and the session keyword index exist.
    ///
    /// Never fails: problems are logged and returned in the report.
    pub async fn provision(&self) -> ProvisionReport {
        let mut report = ProvisionReport::default();
        let dims = self.embedder.dimensions();

        for collection in [Collection::Global, Collection::Session] {
            let name = self.collection_name(collection).to_string();
            match self.store.ensure_collection(&name, dims).await {
                Ok(true) => {
                    info!(collection = %name, dimensions = dims, "Created collection");
                    report.created.push(name.clone());
                }
                Ok(false) => {
                    debug!(collection = %name, "Collection already exists");
                    report.existing.push(name.clone());
                }
                Err(e) => {
                    warn!(collection = %name, error = %e, "Failed to ensure collection");
                    report.failures.push(format!("{name}: {e}"));
                    continue;
                }
            }

            if collection == Collection::Session {
                if let Err(e) = self
                    .store
                    .ensure_keyword_index(&name, &self.config.session_field)
                    .await
                {
                    warn!(
                        collection = %name,
                        field = %self.config.session_field,
                        error = %e,
                        "Failed to ensure session payload index"
                    );
                    report.failures.push(format!("{name} index: {e}"));
                }
            }
        }
        report
    }

    /// Embed the query and return at most `top_k` chunks, best first.
    pub async fn search(
        &self,
        collection: Collection,
        query: &str,
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let vector = self.embedder.embed(query).await?;
        let hits = self
            .store
            .search(self.collection_name(collection), &vector, top_k, filter)
            .await?;

        Ok(hits
            .into_iter()
            .map(|hit| ScoredChunk {
                text: hit.payload["page_content"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                score: hit.score,
                metadata: hit.payload["metadata"]
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect())
    }

    /// Embed and store chunks. Every call writes new points; nothing is deduplicated.
    ///
    /// Chunks bound for the session collection must already carry a
    /// non-empty `session_id`; see [`Self::add_session_documents`].
    pub async fn add(
        &self,
        collection: Collection,
        chunks: &[DocumentChunk],
    ) -> Result<usize, StoreError> {
        if collection == Collection::Session {
            if let Some(chunk) = chunks.iter().find(|c| !has_session_tag(c)) {
                let source_name = chunk
                    .metadata
                    .get("source")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                return Err(StoreError::UntaggedSessionChunk {
                    source_name: source_name.to_string(),
                });
            }
        }
        if chunks.is_empty() {
            return Ok(0);
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        if vectors.len() != chunks.len() {
            return Err(StoreError::Embedding {
                message: format!("expected {} vectors, got {}", chunks.len(), vectors.len()),
            });
        }

        let points = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| PointRecord {
                id: Uuid::new_v4(),
                vector,
                payload: chunk.to_payload(),
            })
            .collect();

        let name = self.collection_name(collection);
        self.store.upsert(name, points).await?;
        debug!(collection = name, count = chunks.len(), "Stored chunks");
        Ok(chunks.len())
    }

    /// Tag chunks with `session_id` and store them in the session collection.
    pub async fn add_session_documents(
        &self,
        chunks: &[DocumentChunk],
        session_id: &str,
    ) -> Result<usize, StoreError> {
        let tagged: Vec<DocumentChunk> = chunks
            .iter()
            .cloned()
            .map(|mut chunk| {
                chunk
                    .metadata
                    .insert("session_id".into(), Value::String(session_id.to_string()));
                chunk
            })
            .collect();
        self.add(Collection::Session, &tagged).await
    }

    /// Search the session collection, restricted to `session_id`.
    pub async fn search_session(
        &self,
        session_id: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let filter = MetadataFilter::equals(self.config.session_field.clone(), session_id);
        self.search(Collection::Session, query, top_k, Some(&filter))
            .await
    }
}

fn has_session_tag(chunk: &DocumentChunk) -> bool {
    chunk
        .metadata
        .get("session_id")
        .and_then(Value::as_str)
        .is_some_and(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::LocalEmbedder;
    use crate::splitter::{SourceDocument, TextSplitter};
    use crate::store::InMemoryStore;

    async fn gateway() -> (KnowledgeGateway, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let gateway = KnowledgeGateway::new(
            Arc::new(LocalEmbedder::new(64)),
            store.clone(),
            StoreConfig::default(),
        );
        let report = gateway.provision().await;
        assert!(report.is_ok());
        (gateway, store)
    }

    fn chunks(text: &str, source: &str) -> Vec<DocumentChunk> {
        TextSplitter::default().split_document(&SourceDocument::from_source(text, source))
    }

    #[tokio::test]
    async fn test_provision_is_idempotent_and_indexes_sessions() {
        let (gateway, store) = gateway().await;
        assert!(store.has_keyword_index("dbeb_sessions", "metadata.session_id").await);

        let again = gateway.provision().await;
        assert!(again.created.is_empty());
        assert_eq!(again.existing, vec!["dbeb", "dbeb_sessions"]);
    }

    #[tokio::test]
    async fn test_global_search_ranks_relevant_chunk_first() {
        let (gateway, _) = gateway().await;
        gateway
            .add(Collection::Global, &chunks("Paris is the capital of France", "geo.txt"))
            .await
            .unwrap();
        gateway
            .add(Collection::Global, &chunks("Bananas are rich in potassium", "food.txt"))
            .await
            .unwrap();

        let hits = gateway
            .search(Collection::Global, "capital of France", 4, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].metadata["source"], "geo.txt");
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn test_untagged_session_write_is_refused() {
        let (gateway, store) = gateway().await;
        let err = gateway
            .add(Collection::Session, &chunks("alpha project budget report", "untagged.pdf"))
            .await
            .unwrap_err();
        match err {
            StoreError::UntaggedSessionChunk { source_name } => {
                assert_eq!(source_name, "untagged.pdf")
            }
            e => panic!("Expected UntaggedSessionChunk, got: {e:?}"),
        }
        assert_eq!(store.point_count("dbeb_sessions").await, 0);
    }

    #[tokio::test]
    async fn test_session_search_is_isolated() {
        let (gateway, _) = gateway().await;
        gateway
            .add_session_documents(&chunks("alpha project budget report", "s1.pdf"), "s1")
            .await
            .unwrap();
        gateway
            .add_session_documents(&chunks("alpha project budget report", "s2.pdf"), "s2")
            .await
            .unwrap();

        let hits = gateway.search_session("s1", "alpha budget", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata["session_id"], "s1");
        assert_eq!(hits[0].metadata["source"], "s1.pdf");

        assert!(gateway.search_session("s3", "alpha", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_readding_content_is_not_deduplicated() {
        let (gateway, store) = gateway().await;
        let text = "x".repeat(1000);
        let first = gateway.add(Collection::Global, &chunks(&text, "a.txt")).await.unwrap();
        gateway.add(Collection::Global, &chunks(&text, "a.txt")).await.unwrap();
        assert_eq!(store.point_count("dbeb").await, first * 2);
    }

    #[tokio::test]
    async fn test_search_respects_top_k() {
        let (gateway, _) = gateway().await;
        for i in 0..6 {
            gateway
                .add(Collection::Global, &chunks(&format!("document number {i}"), "d.txt"))
                .await
                .unwrap();
        }
        let hits = gateway
            .search(Collection::Global, "document", 4, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 4);
    }

    #[tokio::test]
    async fn test_provision_failure_is_reported_not_fatal() {
        let gateway = KnowledgeGateway::new(
            Arc::new(LocalEmbedder::new(8)),
            Arc::new(crate::store::QdrantStore::new(&StoreConfig {
                url: "http://127.0.0.1:9".into(),
                timeout_secs: 1,
                ..Default::default()
            })
            .unwrap()),
            StoreConfig::default(),
        );
        let report = gateway.provision().await;
        assert_eq!(report.failures.len(), 2);
        assert!(!report.is_ok());
    }

    #[tokio::test]
    async fn test_add_empty_is_noop() {
        let (gateway, store) = gateway().await;
        assert_eq!(gateway.add(Collection::Global, &[]).await.unwrap(), 0);
        assert_eq!(store.point_count("dbeb").await, 0);
    }
}
