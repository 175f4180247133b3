//! LLM provider implementations.
//!
//! Use `create_provider()` to instantiate the provider named in the config:
//! `"gemini"` for the Google Gemini API, `"mock"` for offline runs.

pub mod gemini;

use crate::brain::{LlmProvider, MockLlmProvider};
use crate::config::LlmConfig;
use crate::error::LlmError;
use std::sync::Arc;

pub use gemini::GeminiProvider;

/// Build the configured chat-completion provider.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.provider.as_str() {
        "gemini" | "google" => Ok(Arc::new(GeminiProvider::new(config)?)),
        "mock" => Ok(Arc::new(MockLlmProvider::new())),
        other => Err(LlmError::ApiRequest {
            message: format!("Unsupported LLM provider '{other}'. Use 'gemini' or 'mock'."),
        }),
    }
}
