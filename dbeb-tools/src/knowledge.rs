//! Retrieval tools over the knowledge store.
//!
//! `search_global_knowledge` reads the shared collection.
//! `search_session_knowledge` reads only the chunks uploaded under the
//! calling thread, taken from the [`ToolContext`].
//!
//! Store failures are reported back to the model as plain text rather than
//! as tool errors, so the model can still answer.

use crate::registry::{required_str, Tool};
use async_trait::async_trait;
use dbeb_core::dispatch::ToolContext;
use dbeb_core::error::ToolError;
use dbeb_core::knowledge::{Collection, KnowledgeGateway, ScoredChunk};
use dbeb_core::types::ToolOutput;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const GLOBAL_SEARCH_TOOL: &str = "search_global_knowledge";
pub const SESSION_SEARCH_TOOL: &str = "search_session_knowledge";

const NO_SESSION: &str = "No session context found. Cannot search session documents.";
const NO_SESSION_RESULTS: &str = "No relevant information found in session documents.";

fn query_schema(description: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": description
            }
        },
        "required": ["query"]
    })
}

fn join_chunks(hits: &[ScoredChunk]) -> String {
    hits.iter()
        .map(|hit| hit.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Similarity search over the shared knowledge base.
pub struct GlobalSearchTool {
    knowledge: Arc<KnowledgeGateway>,
    top_k: usize,
    timeout: Duration,
}

impl GlobalSearchTool {
    pub fn new(knowledge: Arc<KnowledgeGateway>, top_k: usize, timeout: Duration) -> Self {
        Self {
            knowledge,
            top_k,
            timeout,
        }
    }
}

#[async_trait]
impl Tool for GlobalSearchTool {
    fn name(&self) -> &str {
        GLOBAL_SEARCH_TOOL
    }

    fn description(&self) -> &str {
        "Searches the global/admin knowledge base for general information. \
         Use this for questions about the core dataset or general topics."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        query_schema("What to look up in the shared knowledge base")
    }

    async fn execute(
        &self,
        _ctx: &ToolContext,
        args: serde_json::Value,
    ) -> Result<ToolOutput, ToolError> {
        let query = required_str(GLOBAL_SEARCH_TOOL, &args, "query")?;
        match self
            .knowledge
            .search(Collection::Global, query, self.top_k, None)
            .await
        {
            Ok(hits) => {
                debug!(query, hits = hits.len(), "Global knowledge search");
                Ok(ToolOutput::text(join_chunks(&hits)))
            }
            Err(e) => {
                warn!(error = %e, "Global knowledge search failed");
                Ok(ToolOutput::text(format!("Error searching global knowledge: {e}")))
            }
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Similarity search restricted to the calling thread's uploads.
pub struct SessionSearchTool {
    knowledge: Arc<KnowledgeGateway>,
    top_k: usize,
    timeout: Duration,
}

impl SessionSearchTool {
    pub fn new(knowledge: Arc<KnowledgeGateway>, top_k: usize, timeout: Duration) -> Self {
        Self {
            knowledge,
            top_k,
            timeout,
        }
    }
}

#[async_trait]
impl Tool for SessionSearchTool {
    fn name(&self) -> &str {
        SESSION_SEARCH_TOOL
    }

    fn description(&self) -> &str {
        "Searches the session-specific documents uploaded by the user. \
         Use this when the user asks about a file they just uploaded."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        query_schema("What to look up in the documents uploaded in this conversation")
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        args: serde_json::Value,
    ) -> Result<ToolOutput, ToolError> {
        let query = required_str(SESSION_SEARCH_TOOL, &args, "query")?;
        let Some(session_id) = ctx.session_id() else {
            return Ok(ToolOutput::text(NO_SESSION));
        };

        match self
            .knowledge
            .search_session(session_id, query, self.top_k)
            .await
        {
            Ok(hits) if hits.is_empty() => Ok(ToolOutput::text(NO_SESSION_RESULTS)),
            Ok(hits) => {
                debug!(session_id, query, hits = hits.len(), "Session knowledge search");
                Ok(ToolOutput::text(join_chunks(&hits)))
            }
            Err(e) => {
                warn!(session_id, error = %e, "Session knowledge search failed");
                Ok(ToolOutput::text(format!("Error searching session documents: {e}")))
            }
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbeb_core::config::StoreConfig;
    use dbeb_core::embeddings::LocalEmbedder;
    use dbeb_core::splitter::{SourceDocument, TextSplitter};
    use dbeb_core::store::{InMemoryStore, QdrantStore};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn knowledge() -> Arc<KnowledgeGateway> {
        let gateway = KnowledgeGateway::new(
            Arc::new(LocalEmbedder::new(64)),
            Arc::new(InMemoryStore::new()),
            StoreConfig::default(),
        );
        gateway.provision().await;
        Arc::new(gateway)
    }

    async fn add_session(gateway: &KnowledgeGateway, text: &str, session: &str) {
        let chunks =
            TextSplitter::default().split_document(&SourceDocument::from_source(text, "up.pdf"));
        gateway.add_session_documents(&chunks, session).await.unwrap();
    }

    #[tokio::test]
    async fn test_global_search_joins_chunks() {
        let gateway = knowledge().await;
        for text in ["Rust has ownership", "Rust has traits"] {
            let chunks =
                TextSplitter::default().split_document(&SourceDocument::from_source(text, "a.txt"));
            gateway.add(Collection::Global, &chunks).await.unwrap();
        }
        let tool = GlobalSearchTool::new(gateway, 4, TIMEOUT);
        let output = tool
            .execute(&ToolContext::anonymous(), json!({"query": "rust"}))
            .await
            .unwrap();
        let mut parts: Vec<&str> = output.content.split("\n\n").collect();
        parts.sort();
        assert_eq!(parts, vec!["Rust has ownership", "Rust has traits"]);
    }

    #[tokio::test]
    async fn test_session_search_without_context() {
        let tool = SessionSearchTool::new(knowledge().await, 4, TIMEOUT);
        let output = tool
            .execute(&ToolContext::anonymous(), json!({"query": "anything"}))
            .await
            .unwrap();
        assert_eq!(output.content, NO_SESSION);
        assert!(!output.is_error());
    }

    #[tokio::test]
    async fn test_session_search_is_isolated() {
        let gateway = knowledge().await;
        add_session(&gateway, "The launch code is alpha", "s1").await;
        add_session(&gateway, "The launch code is bravo", "s2").await;
        let tool = SessionSearchTool::new(gateway, 4, TIMEOUT);

        let output = tool
            .execute(&ToolContext::for_session("s1"), json!({"query": "launch code"}))
            .await
            .unwrap();
        assert_eq!(output.content, "The launch code is alpha");

        let output = tool
            .execute(&ToolContext::for_session("s3"), json!({"query": "launch code"}))
            .await
            .unwrap();
        assert_eq!(output.content, NO_SESSION_RESULTS);
    }

    #[tokio::test]
    async fn test_store_error_is_reported_as_text() {
        let store = QdrantStore::new(&StoreConfig {
            url: "http://127.0.0.1:9".into(),
            timeout_secs: 1,
            ..Default::default()
        })
        .unwrap();
        let gateway = Arc::new(KnowledgeGateway::new(
            Arc::new(LocalEmbedder::new(8)),
            Arc::new(store),
            StoreConfig::default(),
        ));

        let global = GlobalSearchTool::new(gateway.clone(), 4, TIMEOUT);
        let output = global
            .execute(&ToolContext::anonymous(), json!({"query": "x"}))
            .await
            .unwrap();
        assert!(output.content.starts_with("Error searching global knowledge: "));
        assert!(!output.is_error());

        let session = SessionSearchTool::new(gateway, 4, TIMEOUT);
        let output = session
            .execute(&ToolContext::for_session("s1"), json!({"query": "x"}))
            .await
            .unwrap();
        assert!(output.content.starts_with("Error searching session documents: "));
    }

    #[tokio::test]
    async fn test_missing_query_is_invalid() {
        let tool = GlobalSearchTool::new(knowledge().await, 4, TIMEOUT);
        let result = tool.execute(&ToolContext::anonymous(), json!({})).await;
        assert!(matches!(result, Err(ToolError::InvalidArguments { .. })));
    }
}
