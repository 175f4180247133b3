//! Tool Registry: named tool registration, definitions for the model, and
//! execution with a per-tool timeout.
//!
//! The registry is the agent graph's [`ToolDispatcher`]; request context is
//! passed through to every tool call.

use async_trait::async_trait;
use dbeb_core::dispatch::{ToolContext, ToolDispatcher};
use dbeb_core::error::ToolError;
use dbeb_core::types::{ToolDefinition, ToolOutput};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Trait that all tools must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// Description shown to the model.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(
        &self,
        ctx: &ToolContext,
        args: serde_json::Value,
    ) -> Result<ToolOutput, ToolError>;

    /// Maximum execution time before timeout.
    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }
}

/// Pull a required string argument out of a tool call.
pub fn required_str<'a>(
    tool: &str,
    args: &'a serde_json::Value,
    key: &str,
) -> Result<&'a str, ToolError> {
    args[key].as_str().ok_or_else(|| ToolError::InvalidArguments {
        name: tool.to_string(),
        reason: format!("missing '{key}' parameter"),
    })
}

/// The tool registry holds all registered tools and handles execution.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Returns error if a tool with the same name is already registered.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::AlreadyRegistered { name });
        }
        debug!(tool = %name, "Registering tool");
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Tool definitions for the model, ordered by name.
    pub fn list_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a tool by name with the given arguments, applying timeout.
    pub async fn execute(
        &self,
        ctx: &ToolContext,
        name: &str,
        args: serde_json::Value,
    ) -> Result<ToolOutput, ToolError> {
        let tool = self.tools.get(name).ok_or_else(|| ToolError::NotFound {
            name: name.to_string(),
        })?;

        let timeout = tool.timeout();
        info!(
            tool = %name,
            request_id = %ctx.request_id,
            timeout_secs = timeout.as_secs(),
            "Executing tool"
        );

        match tokio::time::timeout(timeout, tool.execute(ctx, args)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                name: name.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolDispatcher for ToolRegistry {
    async fn dispatch(
        &self,
        ctx: &ToolContext,
        name: &str,
        args: serde_json::Value,
    ) -> Result<ToolOutput, ToolError> {
        self.execute(ctx, name, args).await
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.list_definitions()
    }
}
