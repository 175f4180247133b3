//! HTTP gateway server built on axum.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::auth::AdminAuth;
use super::handlers;
use crate::agent::AgentGraph;
use crate::brain::{Brain, LlmProvider, DEFAULT_SYSTEM_PROMPT};
use crate::config::AppConfig;
use crate::dispatch::ToolDispatcher;
use crate::evaluator::CandidateEvaluator;
use crate::knowledge::KnowledgeGateway;
use crate::router::IntentRouter;
use crate::session::SessionStore;

/// Long-lived handles shared by every request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub knowledge: Arc<KnowledgeGateway>,
    pub agent: Arc<AgentGraph>,
    pub router: Arc<IntentRouter>,
    pub evaluator: Arc<CandidateEvaluator>,
    pub auth: AdminAuth,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("gateway", &self.config.gateway)
            .field("max_hops", &self.config.agent.max_hops)
            .finish()
    }
}

impl AppState {
    /// Wire the agent graph, intent router and evaluator around one provider.
    pub fn new(
        config: AppConfig,
        provider: Arc<dyn LlmProvider>,
        knowledge: Arc<KnowledgeGateway>,
        tools: Arc<dyn ToolDispatcher>,
    ) -> Self {
        let prompt = config
            .agent
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        let brain = Brain::new(provider.clone(), prompt)
            .with_temperature(config.llm.temperature)
            .with_max_tokens(config.llm.max_tokens);
        let sessions = Arc::new(
            SessionStore::new(config.agent.history_window).with_limits(
                Duration::from_secs(config.agent.session_idle_secs),
                config.agent.max_sessions,
            ),
        );
        let agent = AgentGraph::new(brain, tools, sessions, config.agent.clone());
        let router =
            IntentRouter::new(provider.clone()).with_temperature(config.llm.classifier_temperature);
        let evaluator = CandidateEvaluator::new(provider, &config.evaluation)
            .with_temperature(config.llm.temperature);

        Self {
            auth: AdminAuth::from_config(&config.gateway),
            config: Arc::new(config),
            knowledge,
            agent: Arc::new(agent),
            router: Arc::new(router),
            evaluator: Arc::new(evaluator),
        }
    }
}

/// Body of `GET /`.
pub fn index_document() -> Value {
    json!({
        "service": "DBEB RAG Agent Backend",
        "status": "ok",
        "endpoints": [
            {"method": "GET", "path": "/health", "desc": "Service health"},
            {"method": "POST", "path": "/agent", "desc": "Unified AI agent endpoint"},
            {"method": "POST", "path": "/stream", "desc": "Legacy chat stream"},
            {"method": "POST", "path": "/upload", "desc": "Admin upload to the global knowledge base"},
            {"method": "POST", "path": "/upload-session", "desc": "Upload a document for one session"},
            {"method": "POST", "path": "/evaluate-candidates", "desc": "Batch candidate evaluation"},
        ],
    })
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

/// Build the axum router for every endpoint.
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.gateway.cors_origins);
    let body_limit = state.config.gateway.max_upload_bytes;
    Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health))
        .route("/agent", post(handlers::agent))
        .route("/stream", post(handlers::stream))
        .route("/upload", post(handlers::upload))
        .route("/upload-session", post(handlers::upload_session))
        .route("/evaluate-candidates", post(handlers::evaluate_candidates))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve on the configured address until the task is cancelled.
pub async fn run(state: AppState) -> Result<(), std::io::Error> {
    let addr = format!("{}:{}", state.config.gateway.host, state.config.gateway.port);
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "DBEB gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}
