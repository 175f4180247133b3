//! The seam between the agent graph and the tool registry.
//!
//! Request-scoped identity travels as an explicit [`ToolContext`] argument
//! from the HTTP entry point down to each tool invocation.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::ToolError;
use crate::types::{ToolDefinition, ToolOutput};

/// Per-request context handed to every tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolContext {
    /// Thread whose session documents tools may search.
    pub session_id: Option<String>,
    pub request_id: Uuid,
}

impl ToolContext {
    pub fn new(session_id: Option<String>) -> Self {
        Self {
            session_id: session_id.filter(|s| !s.is_empty()),
            request_id: Uuid::new_v4(),
        }
    }

    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self::new(Some(session_id.into()))
    }

    /// A context with no session bound.
    pub fn anonymous() -> Self {
        Self::new(None)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

/// Something that can run named tools on the agent's behalf.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Run tool `name` with JSON `args` under `ctx`.
    async fn dispatch(
        &self,
        ctx: &ToolContext,
        name: &str,
        args: Value,
    ) -> Result<ToolOutput, ToolError>;

    /// Schemas advertised to the model.
    fn definitions(&self) -> Vec<ToolDefinition>;
}
