//! Configuration system for the DBEB backend.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment.
//! Configuration is loaded from the user config directory (`config.toml`) and/or
//! `dbeb.toml` in the working directory. The variable names of the original
//! deployment (`QDRANT_URL`, `ADMIN_KEY`, ...) are honored on top of the
//! `DBEB_`-prefixed ones.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::embeddings::EmbeddingConfig;
use crate::gateway::GatewayConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
}

/// Configuration for the chat-completion model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name. Only "gemini" talks to a real service; "mock" is for offline runs.
    pub provider: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Explicit API key. Never written back to disk.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    pub max_tokens: usize,
    /// Sampling temperature for chat turns and candidate evaluation.
    pub temperature: f32,
    /// Sampling temperature for intent classification.
    pub classifier_temperature: f32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            model: "gemini-2.5-flash".to_string(),
            api_key_env: "GOOGLE_API_KEY".to_string(),
            api_key: None,
            base_url: None,
            max_tokens: 4096,
            temperature: 0.5,
            classifier_temperature: 0.0,
            timeout_secs: 120,
        }
    }
}

/// Vector index connection and collection layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// "qdrant" or "memory".
    pub provider: String,
    pub url: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    pub global_collection: String,
    pub session_collection: String,
    /// Payload path that carries the owning session of a chunk.
    pub session_field: String,
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            provider: "qdrant".to_string(),
            url: "http://localhost:6333".to_string(),
            api_key: None,
            global_collection: "dbeb".to_string(),
            session_collection: "dbeb_sessions".to_string(),
            session_field: "metadata.session_id".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Agent graph bounds and retrieval depth.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Maximum number of model invocations in one turn.
    pub max_hops: usize,
    /// Maximum number of messages retained per session.
    pub history_window: usize,
    /// Number of chunks each knowledge tool returns.
    pub top_k: usize,
    /// Optional system prompt prepended to every model invocation.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Per-tool execution timeout.
    pub tool_timeout_secs: u64,
    /// Threads untouched for this long are dropped from history.
    pub session_idle_secs: u64,
    /// Upper bound on threads held in memory; the least recently used go first.
    pub max_sessions: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_hops: 8,
            history_window: 40,
            top_k: 4,
            system_prompt: None,
            tool_timeout_secs: 30,
            session_idle_secs: 6 * 60 * 60,
            max_sessions: 1000,
        }
    }
}

/// Document splitting and upload batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Number of chunks written to the store per progress step.
    pub batch_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size: 400,
            chunk_overlap: 200,
            batch_size: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Resume text is cut to this many characters before it reaches the model.
    pub max_resume_chars: usize,
    /// Largest single file unpacked from a resume archive.
    pub max_archive_entry_bytes: u64,
    /// Largest total size unpacked from a resume archive.
    pub max_archive_bytes: u64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            max_resume_chars: 6000,
            max_archive_entry_bytes: 20 * 1024 * 1024,
            max_archive_bytes: 200 * 1024 * 1024,
        }
    }
}

/// Name of the workspace-level config file.
pub const WORKSPACE_CONFIG_FILE: &str = "dbeb.toml";

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Legacy variables (`QDRANT_URL`, `QDRANT_API_KEY`, `ADMIN_KEY`, `LLM_MODEL`, `EMBEDDING_MODEL`)
/// 2. Environment variables (prefixed with `DBEB_`, `__` separates sections)
/// 3. Explicit config file, if given
/// 4. Workspace-local config (`dbeb.toml`)
/// 5. User config (`~/.config/dbeb/config.toml`)
/// 6. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
) -> Result<AppConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "dbeb", "dbeb") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(WORKSPACE_CONFIG_FILE);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(file) = config_file {
        figment = figment.merge(Toml::file(file));
    }

    // DBEB_STORE__URL, DBEB_AGENT__MAX_HOPS, etc.
    figment = figment.merge(Env::prefixed("DBEB_").split("__"));
    figment = figment.merge(legacy_env());

    figment.extract().map_err(Box::new)
}

/// Maps the flat variable names used by earlier deployments onto config paths.
fn legacy_env() -> Env {
    Env::raw()
        .only(&[
            "QDRANT_URL",
            "QDRANT_API_KEY",
            "ADMIN_KEY",
            "LLM_MODEL",
            "EMBEDDING_MODEL",
        ])
        .map(|key| {
            let target = match key.as_str().to_ascii_uppercase().as_str() {
                "QDRANT_URL" => "store.url",
                "QDRANT_API_KEY" => "store.api_key",
                "ADMIN_KEY" => "gateway.admin_key",
                "LLM_MODEL" => "llm.model",
                "EMBEDDING_MODEL" => "embedding.model",
                other => return other.to_ascii_lowercase().into(),
            };
            target.into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.llm.provider, "gemini");
        assert_eq!(config.llm.model, "gemini-2.5-flash");
        assert_eq!(config.llm.api_key_env, "GOOGLE_API_KEY");
        assert_eq!(config.store.url, "http://localhost:6333");
        assert_eq!(config.store.global_collection, "dbeb");
        assert_eq!(config.store.session_collection, "dbeb_sessions");
        assert_eq!(config.store.session_field, "metadata.session_id");
        assert_eq!(config.ingest.chunk_size, 400);
        assert_eq!(config.ingest.chunk_overlap, 200);
        assert_eq!(config.ingest.batch_size, 20);
        assert_eq!(config.evaluation.max_resume_chars, 6000);
        assert_eq!(config.agent.top_k, 4);
        assert!(config.agent.max_hops > 0);
        assert!(config.agent.history_window > 0);
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized.llm.model, config.llm.model);
        assert_eq!(deserialized.agent.max_hops, config.agent.max_hops);
        assert_eq!(deserialized.gateway.port, config.gateway.port);
    }

    #[test]
    fn test_api_key_not_serialized() {
        let mut config = AppConfig::default();
        config.llm.api_key = Some("super-secret".into());
        config.store.api_key = Some("qdrant-secret".into());
        let toml_str = toml::to_string(&config).unwrap();
        assert!(!toml_str.contains("super-secret"));
        assert!(!toml_str.contains("qdrant-secret"));
    }

    #[test]
    fn test_load_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.ingest.chunk_size, 400);
    }

    #[test]
    fn test_load_config_workspace_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(WORKSPACE_CONFIG_FILE),
            r#"
[agent]
max_hops = 3
history_window = 10
top_k = 2
tool_timeout_secs = 5

[store]
provider = "memory"
url = "http://qdrant:6333"
global_collection = "kb"
session_collection = "kb_sessions"
session_field = "metadata.session_id"
timeout_secs = 10
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.agent.max_hops, 3);
        assert_eq!(config.agent.top_k, 2);
        assert_eq!(config.store.provider, "memory");
        assert_eq!(config.store.global_collection, "kb");
        // Untouched sections keep their defaults.
        assert_eq!(config.ingest.chunk_overlap, 200);
    }

    #[test]
    fn test_explicit_file_overrides_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(WORKSPACE_CONFIG_FILE),
            "[ingest]\nchunk_size = 500\nchunk_overlap = 100\nbatch_size = 10\n",
        )
        .unwrap();
        let explicit = dir.path().join("override.toml");
        std::fs::write(
            &explicit,
            "[ingest]\nchunk_size = 800\nchunk_overlap = 100\nbatch_size = 10\n",
        )
        .unwrap();

        let config = load_config(Some(dir.path()), Some(&explicit)).unwrap();
        assert_eq!(config.ingest.chunk_size, 800);
    }
}
