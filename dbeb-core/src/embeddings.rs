//! Pluggable embedding providers for the knowledge store.
//!
//! Provides a trait-based abstraction over embedding models, with implementations
//! for a local hashed term-frequency embedder (always available, used offline and
//! in tests), any OpenAI-compatible `/v1/embeddings` server (including text
//! embedding inference servers hosting `all-MiniLM-L6-v2`), and Ollama.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::StoreError;

/// Trait for embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate embeddings for a batch of texts, preserving order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, StoreError>;

    /// Generate an embedding for a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StoreError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| StoreError::Embedding {
            message: "provider returned no vectors".to_string(),
        })
    }

    /// Return the dimensionality of embeddings.
    fn dimensions(&self) -> usize;

    /// Return the provider name.
    fn provider_name(&self) -> &str;
}

/// Configuration for embedding providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider name: "local" (default), "openai", "ollama"
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Provider-specific model name.
    #[serde(default = "default_model")]
    pub model: String,
    /// Embedding dimensions. Collections are created with this size.
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
    /// Batch size for bulk embedding requests.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Service base URL for HTTP providers.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding a bearer token for HTTP providers.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

fn default_provider() -> String {
    "local".into()
}

fn default_model() -> String {
    "sentence-transformers/all-MiniLM-L6-v2".into()
}

fn default_dimensions() -> usize {
    384
}

fn default_batch_size() -> usize {
    32
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            dimensions: default_dimensions(),
            batch_size: default_batch_size(),
            base_url: None,
            api_key_env: None,
        }
    }
}

/// Local hashed term-frequency embedder.
///
/// Words are lowercased, split on non-alphanumerics, hashed into buckets and
/// the resulting vector is L2 normalized, so cosine similarity reflects shared
/// vocabulary.
#[derive(Debug, Clone, Copy)]
pub struct LocalEmbedder {
    dimensions: usize,
}

impl LocalEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    /// Embed one text synchronously.
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        let lowered = text.to_lowercase();
        let mut tf: HashMap<&str, usize> = HashMap::new();
        for word in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            *tf.entry(word).or_insert(0) += 1;
        }

        if tf.is_empty() {
            return vector;
        }

        for (term, count) in &tf {
            let idx = djb2(term) % self.dimensions;
            vector[idx] += *count as f32;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }

        vector
    }
}

fn djb2(s: &str) -> usize {
    let mut hash: usize = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    hash
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, StoreError> {
        let embedder = *self;
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || texts.iter().map(|t| embedder.embed_sync(t)).collect())
            .await
            .map_err(|e| StoreError::Embedding {
                message: format!("embedding worker failed: {e}"),
            })
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn provider_name(&self) -> &str {
        "local"
    }
}

/// Embedder for any server speaking the OpenAI embeddings protocol.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    dims: usize,
    base_url: String,
    batch_size: usize,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: config.model.clone(),
            dims: config.dimensions,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".into()),
            batch_size: config.batch_size.max(1),
        }
    }

    async fn embed_api_call(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, StoreError> {
        let url = format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": batch,
        });

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let json = send_json(request).await?;
        let data = json["data"]
            .as_array()
            .ok_or_else(|| StoreError::Embedding {
                message: "response is missing 'data'".to_string(),
            })?;

        // Entries carry their input index; order by it rather than trusting array order.
        let mut indexed: Vec<(usize, Vec<f32>)> = data
            .iter()
            .enumerate()
            .map(|(pos, item)| {
                let index = item["index"].as_u64().map(|i| i as usize).unwrap_or(pos);
                (index, parse_vector(&item["embedding"]))
            })
            .collect();
        indexed.sort_by_key(|(index, _)| *index);
        Ok(indexed.into_iter().map(|(_, v)| v).collect())
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, StoreError> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            out.extend(self.embed_api_call(batch).await?);
        }
        check_shape(&out, texts.len(), self.dims)?;
        Ok(out)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_name(&self) -> &str {
        "openai"
    }
}

/// Ollama embedder (uses the local Ollama API).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    base_url: String,
    batch_size: usize,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            model: config.model.clone(),
            dims: config.dimensions,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".into()),
            batch_size: config.batch_size.max(1),
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, StoreError> {
        let url = format!("{}/api/embed", self.base_url.trim_end_matches('/'));
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let body = serde_json::json!({
                "model": self.model,
                "input": batch,
            });
            let json = send_json(self.client.post(&url).json(&body)).await?;
            let embeddings = json["embeddings"]
                .as_array()
                .ok_or_else(|| StoreError::Embedding {
                    message: "response is missing 'embeddings'".to_string(),
                })?;
            out.extend(embeddings.iter().map(parse_vector));
        }
        check_shape(&out, texts.len(), self.dims)?;
        Ok(out)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_name(&self) -> &str {
        "ollama"
    }
}

async fn send_json(request: reqwest::RequestBuilder) -> Result<serde_json::Value, StoreError> {
    let response = request.send().await.map_err(|e| StoreError::Embedding {
        message: format!("request failed: {e}"),
    })?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(StoreError::Embedding {
            message: format!("HTTP {status}: {body}"),
        });
    }
    response.json().await.map_err(|e| StoreError::Embedding {
        message: format!("invalid JSON: {e}"),
    })
}

fn parse_vector(value: &serde_json::Value) -> Vec<f32> {
    value
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect()
        })
        .unwrap_or_default()
}

fn check_shape(vectors: &[Vec<f32>], expected_len: usize, dims: usize) -> Result<(), StoreError> {
    if vectors.len() != expected_len {
        return Err(StoreError::Embedding {
            message: format!("expected {expected_len} vectors, got {}", vectors.len()),
        });
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(StoreError::Dimension {
            expected: dims,
            actual: bad.len(),
        });
    }
    Ok(())
}

/// Factory function to create an embedder based on configuration.
pub fn create_embedder(config: &EmbeddingConfig) -> Arc<dyn Embedder> {
    match config.provider.as_str() {
        "openai" => {
            let api_key = config
                .api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
                .filter(|k| !k.is_empty());
            Arc::new(OpenAiEmbedder::new(config, api_key))
        }
        "ollama" => Arc::new(OllamaEmbedder::new(config)),
        "local" => Arc::new(LocalEmbedder::new(config.dimensions)),
        other => {
            tracing::warn!(provider = other, "Unknown embedding provider, using local");
            Arc::new(LocalEmbedder::new(config.dimensions))
        }
    }
}

/// Cosine similarity between two vectors of equal length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_embedder_dimensions() {
        let embedder = LocalEmbedder::new(384);
        assert_eq!(embedder.dimensions(), 384);
        assert_eq!(embedder.embed_sync("hello world").len(), 384);
    }

    #[test]
    fn test_local_embedder_normalized() {
        let embedder = LocalEmbedder::new(128);
        let v = embedder.embed_sync("test input text for normalization");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01, "got norm={norm}");
    }

    #[test]
    fn test_local_embedder_empty_text() {
        let v = LocalEmbedder::new(128).embed_sync("");
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_local_embedder_deterministic() {
        let embedder = LocalEmbedder::new(128);
        assert_eq!(embedder.embed_sync("same text"), embedder.embed_sync("same text"));
    }

    #[tokio::test]
    async fn test_embed_batch_preserves_order() {
        let embedder = LocalEmbedder::new(64);
        let texts = vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()];
        let vectors = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[1], embedder.embed_sync("beta"));
    }

    #[tokio::test]
    async fn test_embed_single_via_default_method() {
        let embedder: Arc<dyn Embedder> = Arc::new(LocalEmbedder::new(32));
        let v = embedder.embed("query").await.unwrap();
        assert_eq!(v.len(), 32);
        assert_eq!(embedder.provider_name(), "local");
    }

    #[test]
    fn test_similar_texts_score_higher() {
        let embedder = LocalEmbedder::new(384);
        let q = embedder.embed_sync("rust async runtime");
        let near = embedder.embed_sync("the async runtime for rust");
        let far = embedder.embed_sync("banana bread recipe");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[test]
    fn test_cosine_similarity_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_check_shape_rejects_wrong_dimension() {
        let err = check_shape(&[vec![0.0; 3]], 1, 4).unwrap_err();
        assert!(matches!(err, StoreError::Dimension { expected: 4, actual: 3 }));
    }

    #[test]
    fn test_embedding_config_defaults() {
        let config = EmbeddingConfig::default();
        assert_eq!(config.provider, "local");
        assert_eq!(config.model, "sentence-transformers/all-MiniLM-L6-v2");
        assert_eq!(config.dimensions, 384);
        assert_eq!(config.batch_size, 32);
    }

    #[test]
    fn test_embedding_config_deserialize_empty() {
        let config: EmbeddingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.provider, "local");
        assert_eq!(config.dimensions, 384);
    }

    #[test]
    fn test_create_embedder_variants() {
        let local = create_embedder(&EmbeddingConfig::default());
        assert_eq!(local.provider_name(), "local");
        assert_eq!(local.dimensions(), 384);

        let ollama = create_embedder(&EmbeddingConfig {
            provider: "ollama".into(),
            ..Default::default()
        });
        assert_eq!(ollama.provider_name(), "ollama");

        let unknown = create_embedder(&EmbeddingConfig {
            provider: "nope".into(),
            ..Default::default()
        });
        assert_eq!(unknown.provider_name(), "local");
    }
}
