//! Error types for the DBEB core library.
//!
//! Uses `thiserror` for public API error types with structured variants covering
//! model calls, tool execution, the vector store, documents, candidate evaluation,
//! and configuration.

use std::path::PathBuf;

/// Top-level error type for the DBEB core library.
#[derive(Debug, thiserror::Error)]
pub enum DbebError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from LLM provider interactions.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Streaming error: {message}")]
    Streaming { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },
}

/// Errors from tool registration and execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool not found: {name}")]
    NotFound { name: String },

    #[error("Tool already registered: {name}")]
    AlreadyRegistered { name: String },

    #[error("Invalid arguments for tool '{name}': {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("Tool '{name}' execution failed: {message}")]
    ExecutionFailed { name: String, message: String },

    #[error("Tool '{name}' timed out after {timeout_secs}s")]
    Timeout { name: String, timeout_secs: u64 },
}

/// Errors from the embedding service and the vector index.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Vector store request failed: {message}")]
    Request { message: String },

    #[error("Vector store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Embedding failed: {message}")]
    Embedding { message: String },

    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },

    #[error("Session chunk from '{source_name}' has no session_id")]
    UntaggedSessionChunk { source_name: String },
}

/// Errors from the agent graph.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Maximum hop count ({max}) exceeded without a final answer")]
    MaxHopsExceeded { max: usize },

    #[error("Model invocation failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Empty user input")]
    EmptyInput,

    #[error("Client disconnected before the turn completed")]
    Disconnected,
}

/// Errors from document loading: text extraction, archives, tables.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Unsupported document type: {path}")]
    Unsupported { path: PathBuf },

    #[error("PDF extraction failed for {path}: {message}")]
    Pdf { path: PathBuf, message: String },

    #[error("Archive error: {message}")]
    Archive { message: String },

    #[error("CSV error: {message}")]
    Csv { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that abort a whole candidate evaluation batch.
///
/// Per-candidate problems never surface here; they are recorded on the
/// candidate's own result entry.
#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("Missing required files: {}", missing.join(", "))]
    MissingInputs { missing: Vec<String> },

    #[error("CSV must include a '{column}' column")]
    MissingColumn { column: String },

    #[error("No candidate rows found in CSV")]
    NoCandidates,

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// A type alias for results using the top-level `DbebError`.
pub type Result<T> = std::result::Result<T, DbebError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_llm() {
        let err = DbebError::Llm(LlmError::ApiRequest {
            message: "connection refused".into(),
        });
        assert_eq!(
            err.to_string(),
            "LLM error: API request failed: connection refused"
        );
    }

    #[test]
    fn test_error_display_tool() {
        let err = DbebError::Tool(ToolError::NotFound {
            name: "nonexistent".into(),
        });
        assert_eq!(err.to_string(), "Tool error: Tool not found: nonexistent");
    }

    #[test]
    fn test_error_display_store() {
        let err = DbebError::Store(StoreError::Status {
            status: 404,
            body: "Not found".into(),
        });
        assert_eq!(
            err.to_string(),
            "Store error: Vector store returned HTTP 404: Not found"
        );
    }

    #[test]
    fn test_error_display_agent() {
        let err = DbebError::Agent(AgentError::MaxHopsExceeded { max: 8 });
        assert_eq!(
            err.to_string(),
            "Agent error: Maximum hop count (8) exceeded without a final answer"
        );
    }

    #[test]
    fn test_evaluation_missing_inputs_lists_all() {
        let err = EvaluationError::MissingInputs {
            missing: vec!["candidates CSV".into(), "resumes ZIP archive".into()],
        };
        assert_eq!(
            err.to_string(),
            "Missing required files: candidates CSV, resumes ZIP archive"
        );
    }

    #[test]
    fn test_evaluation_missing_column() {
        let err = EvaluationError::MissingColumn {
            column: "resume_filename".into(),
        };
        assert_eq!(
            err.to_string(),
            "CSV must include a 'resume_filename' column"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: DbebError = io_err.into();
        assert!(matches!(err, DbebError::Io(_)));
    }

    #[test]
    fn test_agent_error_from_llm() {
        let err: AgentError = LlmError::Timeout { timeout_secs: 120 }.into();
        assert_eq!(
            err.to_string(),
            "Model invocation failed: Request timed out after 120s"
        );
    }
}
