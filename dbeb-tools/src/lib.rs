//! # DBEB Tools
//!
//! Tool implementations for the DBEB agent graph.
//! Provides the tool registry and the two knowledge retrieval tools.

pub mod knowledge;
pub mod registry;

use dbeb_core::config::AgentConfig;
use dbeb_core::error::ToolError;
use dbeb_core::knowledge::KnowledgeGateway;
use registry::{Tool, ToolRegistry};
use std::sync::Arc;
use std::time::Duration;

pub use knowledge::{GlobalSearchTool, SessionSearchTool, GLOBAL_SEARCH_TOOL, SESSION_SEARCH_TOOL};

/// Register the global and session search tools.
pub fn register_knowledge_tools(
    registry: &mut ToolRegistry,
    knowledge: Arc<KnowledgeGateway>,
    config: &AgentConfig,
) -> Result<(), ToolError> {
    let timeout = Duration::from_secs(config.tool_timeout_secs);
    let tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(GlobalSearchTool::new(knowledge.clone(), config.top_k, timeout)),
        Arc::new(SessionSearchTool::new(knowledge, config.top_k, timeout)),
    ];
    for tool in tools {
        registry.register(tool)?;
    }
    Ok(())
}

/// A registry holding every tool the agent graph uses.
pub fn default_registry(
    knowledge: Arc<KnowledgeGateway>,
    config: &AgentConfig,
) -> Result<ToolRegistry, ToolError> {
    let mut registry = ToolRegistry::new();
    register_knowledge_tools(&mut registry, knowledge, config)?;
    Ok(registry)
}
