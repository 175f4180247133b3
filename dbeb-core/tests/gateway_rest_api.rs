//! Integration tests for the gateway REST API, driven through the public router.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use dbeb_core::brain::MockLlmProvider;
use dbeb_core::config::AppConfig;
use dbeb_core::dispatch::{ToolContext, ToolDispatcher};
use dbeb_core::embeddings::LocalEmbedder;
use dbeb_core::error::ToolError;
use dbeb_core::gateway::{router, AppState};
use dbeb_core::knowledge::KnowledgeGateway;
use dbeb_core::store::InMemoryStore;
use dbeb_core::types::{ToolDefinition, ToolOutput};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceExt;

/// Answers every call with the calling session.
struct WhoAmI;

#[async_trait]
impl ToolDispatcher for WhoAmI {
    async fn dispatch(
        &self,
        ctx: &ToolContext,
        _name: &str,
        _args: serde_json::Value,
    ) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::text(format!(
            "session={}",
            ctx.session_id().unwrap_or("none")
        )))
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: "whoami".into(),
            description: "Report the calling session".into(),
            parameters: json!({"type": "object"}),
        }]
    }
}

async fn make_state() -> (AppState, Arc<MockLlmProvider>) {
    let provider = Arc::new(MockLlmProvider::new());
    let config = AppConfig::default();
    let knowledge = Arc::new(KnowledgeGateway::new(
        Arc::new(LocalEmbedder::new(16)),
        Arc::new(InMemoryStore::new()),
        config.store.clone(),
    ));
    knowledge.provision().await;
    let state = AppState::new(config, provider.clone(), knowledge, Arc::new(WhoAmI));
    (state, provider)
}

fn stream_request(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/stream")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(state: AppState, req: Request<Body>) -> (StatusCode, String) {
    let resp = router(state).oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), 1_000_000)
        .await
        .unwrap();
    (status, String::from_utf8_lossy(&body).into_owned())
}

// --- / and /health ---

#[tokio::test]
async fn test_health_and_index() {
    let (state, _) = make_state().await;
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(state.clone(), req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_str::<serde_json::Value>(&body).unwrap(), json!({"status": "ok"}));

    let req = Request::builder().uri("/").body(Body::empty()).unwrap();
    let (status, body) = send(state, req).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["service"], "DBEB RAG Agent Backend");
}

// --- /stream ---

#[tokio::test]
async fn test_stream_remembers_thread_history() {
    let (state, provider) = make_state().await;
    provider.queue_response(MockLlmProvider::text_response("Hi Ada"));
    provider.queue_response(MockLlmProvider::text_response("You are Ada"));

    let (status, body) = send(
        state.clone(),
        stream_request(json!({"thread_id": "t1", "text": "I am Ada"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("data: [DONE]"));

    send(
        state,
        stream_request(json!({"thread_id": "t1", "text": "Who am I?"})),
    )
    .await;

    let second = &provider.requests()[1];
    let texts: Vec<String> = second
        .messages
        .iter()
        .map(|m| m.content.joined_text())
        .collect();
    assert!(texts.iter().any(|t| t == "I am Ada"));
    assert!(texts.iter().any(|t| t == "Hi Ada"));
    assert_eq!(texts.last().map(String::as_str), Some("Who am I?"));
}

#[tokio::test]
async fn test_stream_tool_sees_thread_as_session() {
    let (state, provider) = make_state().await;
    provider.queue_response(MockLlmProvider::tool_call_response("whoami", json!({})));
    provider.queue_response(MockLlmProvider::text_response("done"));

    send(state, stream_request(json!({"thread_id": "t42", "text": "who?"}))).await;

    let second = serde_json::to_string(&provider.requests()[1].messages).unwrap();
    assert!(second.contains("session=t42"));
}

#[tokio::test]
async fn test_threads_do_not_share_history() {
    let (state, provider) = make_state().await;
    provider.queue_response(MockLlmProvider::text_response("noted"));
    provider.queue_response(MockLlmProvider::text_response("no idea"));

    send(
        state.clone(),
        stream_request(json!({"thread_id": "a", "text": "secret is 7"})),
    )
    .await;
    send(state, stream_request(json!({"thread_id": "b", "text": "what is the secret?"}))).await;

    let second = serde_json::to_string(&provider.requests()[1].messages).unwrap();
    assert!(!second.contains("secret is 7"));
}

// --- /upload ---

#[tokio::test]
async fn test_upload_without_key_is_unauthorized() {
    let (state, _) = make_state().await;
    let req = Request::builder()
        .method("POST")
        .uri("/upload")
        .header("content-type", "multipart/form-data; boundary=x")
        .body(Body::from("--x--\r\n"))
        .unwrap();
    let (status, body) = send(state, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("detail"));
}
