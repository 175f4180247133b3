//! # HTTP Gateway
//!
//! The axum server in front of the agent: multipart uploads, server-sent
//! event streams for chat, ingestion and evaluation, and a couple of plain
//! JSON endpoints.

mod auth;
mod error;
mod handlers;
mod server;
mod sse;
mod uploads;
mod workflows;

pub use auth::AdminAuth;
pub use error::ApiError;
pub use server::{index_document, router, run, AppState};
pub use sse::{sse_response, stream_frames, Frame, FrameSink};
pub use uploads::{SavedFile, UploadForm};

use serde::{Deserialize, Serialize};

/// Configuration for the HTTP gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Shared secret required in `X-Admin-Key` for global uploads.
    #[serde(skip_serializing)]
    pub admin_key: String,
    /// Origins allowed by CORS.
    pub cors_origins: Vec<String>,
    /// Largest accepted request body.
    pub max_upload_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            admin_key: "secret-default".to_string(),
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}
