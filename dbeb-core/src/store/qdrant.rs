//! Qdrant vector store over the REST API.
//!
//! Speaks the HTTP interface directly with `reqwest`:
//! - `GET  /collections/{name}` (404 means absent)
//! - `PUT  /collections/{name}` to create with cosine distance
//! - `PUT  /collections/{name}/index` for keyword payload indexes
//! - `PUT  /collections/{name}/points?wait=true` to upsert
//! - `POST /collections/{name}/points/search` for filtered similarity search

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{MetadataFilter, PointRecord, ScoredPoint, VectorStore};
use crate::config::StoreConfig;
use crate::error::StoreError;

/// Qdrant REST client.
pub struct QdrantStore {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    result: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Value,
}

impl QdrantStore {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| StoreError::Request {
                message: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, StoreError> {
        self.authed(builder)
            .send()
            .await
            .map_err(|e| StoreError::Request {
                message: e.to_string(),
            })
    }

    async fn expect_success(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Status {
            status: status.as_u16(),
            body,
        })
    }

    fn search_body(vector: &[f32], limit: usize, filter: Option<&MetadataFilter>) -> Value {
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(filter) = filter {
            body["filter"] = filter.to_qdrant();
        }
        body
    }

    fn upsert_body(points: &[PointRecord]) -> Value {
        let points: Vec<Value> = points
            .iter()
            .map(|p| {
                json!({
                    "id": p.id.to_string(),
                    "vector": p.vector,
                    "payload": p.payload,
                })
            })
            .collect();
        json!({ "points": points })
    }
}

/// Qdrant point ids are either unsigned integers or UUID strings.
fn id_to_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn collection_exists(&self, name: &str) -> Result<bool, StoreError> {
        let response = self
            .send(self.client.get(self.url(&format!("/collections/{name}"))))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::expect_success(response).await?;
        Ok(true)
    }

    async fn create_collection(&self, name: &str, dimensions: usize) -> Result<(), StoreError> {
        debug!(collection = name, dimensions, "Creating Qdrant collection");
        let body = json!({
            "vectors": { "size": dimensions, "distance": "Cosine" }
        });
        let response = self
            .send(
                self.client
                    .put(self.url(&format!("/collections/{name}")))
                    .json(&body),
            )
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn ensure_keyword_index(&self, name: &str, field: &str) -> Result<(), StoreError> {
        debug!(collection = name, field, "Ensuring keyword payload index");
        let body = json!({ "field_name": field, "field_schema": "keyword" });
        let response = self
            .send(
                self.client
                    .put(self.url(&format!("/collections/{name}/index?wait=true")))
                    .json(&body),
            )
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn upsert(&self, name: &str, points: Vec<PointRecord>) -> Result<(), StoreError> {
        if points.is_empty() {
            return Ok(());
        }
        let response = self
            .send(
                self.client
                    .put(self.url(&format!("/collections/{name}/points?wait=true")))
                    .json(&Self::upsert_body(&points)),
            )
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredPoint>, StoreError> {
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("/collections/{name}/points/search")))
                    .json(&Self::search_body(vector, limit, filter)),
            )
            .await?;
        let response = Self::expect_success(response).await?;
        let parsed: SearchResponse = response.json().await.map_err(|e| StoreError::Request {
            message: format!("invalid search response: {e}"),
        })?;

        let mut hits: Vec<ScoredPoint> = parsed
            .result
            .into_iter()
            .map(|hit| ScoredPoint {
                id: id_to_string(&hit.id),
                score: hit.score,
                payload: hit.payload,
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn make_store(api_key: Option<&str>) -> QdrantStore {
        QdrantStore::new(&StoreConfig {
            url: "http://localhost:6333/".into(),
            api_key: api_key.map(String::from),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let store = make_store(None);
        assert_eq!(
            store.url("/collections/dbeb"),
            "http://localhost:6333/collections/dbeb"
        );
    }

    #[test]
    fn test_empty_api_key_is_ignored() {
        assert!(make_store(Some("")).api_key.is_none());
        assert_eq!(make_store(Some("k")).api_key.as_deref(), Some("k"));
    }

    #[test]
    fn test_search_body_with_filter() {
        let filter = MetadataFilter::equals("metadata.session_id", "t1");
        let body = QdrantStore::search_body(&[0.5, 0.5], 4, Some(&filter));
        assert_eq!(body["limit"], 4);
        assert_eq!(body["with_payload"], true);
        assert_eq!(body["filter"]["must"][0]["key"], "metadata.session_id");
        assert_eq!(body["filter"]["must"][0]["match"]["value"], "t1");
    }

    #[test]
    fn test_search_body_without_filter() {
        let body = QdrantStore::search_body(&[1.0], 4, None);
        assert!(body.get("filter").is_none());
    }

    #[test]
    fn test_upsert_body_shape() {
        let id = Uuid::new_v4();
        let body = QdrantStore::upsert_body(&[PointRecord {
            id,
            vector: vec![0.1, 0.2],
            payload: json!({"page_content": "hi", "metadata": {"source": "a.pdf"}}),
        }]);
        assert_eq!(body["points"][0]["id"], id.to_string());
        assert_eq!(body["points"][0]["payload"]["metadata"]["source"], "a.pdf");
    }

    #[test]
    fn test_search_response_parsing() {
        let raw = json!({
            "result": [
                {"id": 7, "score": 0.5, "payload": {"page_content": "b"}},
                {"id": "6f1c0c52-0000-4000-8000-000000000000", "score": 0.9, "payload": {"page_content": "a"}}
            ],
            "status": "ok",
            "time": 0.001
        });
        let parsed: SearchResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.result.len(), 2);
        assert_eq!(id_to_string(&parsed.result[0].id), "7");
        assert_eq!(
            id_to_string(&parsed.result[1].id),
            "6f1c0c52-0000-4000-8000-000000000000"
        );
    }
}
