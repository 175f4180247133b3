//! # DBEB Core
//!
//! Core library for the DBEB retrieval-augmented assistant.
//! Provides the agent graph, the model interface (brain), the knowledge store
//! gateway, intent routing, candidate evaluation, configuration and the HTTP
//! gateway.

pub mod agent;
pub mod brain;
pub mod config;
pub mod dispatch;
pub mod documents;
pub mod embeddings;
pub mod error;
pub mod evaluator;
pub mod gateway;
pub mod knowledge;
pub mod providers;
pub mod router;
pub mod session;
pub mod splitter;
pub mod store;
pub mod structured;
pub mod types;

// Re-export commonly used types at the crate root.
pub use agent::{AgentEvent, AgentGraph, GraphState, TurnOutcome};
pub use brain::{Brain, LlmProvider, MockLlmProvider, DEFAULT_SYSTEM_PROMPT};
pub use config::{load_config, AgentConfig, AppConfig, LlmConfig, StoreConfig};
pub use dispatch::{ToolContext, ToolDispatcher};
pub use error::{DbebError, Result};
pub use evaluator::{CandidateEvaluator, CandidateResult, EvaluationInputs, EvaluationReport};
pub use gateway::{AppState, GatewayConfig};
pub use knowledge::{Collection, KnowledgeGateway, ScoredChunk};
pub use router::{Intent, IntentClassification, IntentRouter};
pub use session::SessionStore;
pub use types::{
    CompletionRequest, CompletionResponse, Content, Message, Role, StreamEvent, TokenUsage,
    ToolDefinition, ToolOutput,
};
