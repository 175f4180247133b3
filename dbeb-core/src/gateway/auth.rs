//! Admin key check for the global upload route.

use axum::http::HeaderMap;

use super::GatewayConfig;

/// Header carrying the admin key.
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// Shared-secret validation for privileged routes.
#[derive(Debug, Clone)]
pub struct AdminAuth {
    admin_key: String,
}

impl AdminAuth {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.admin_key.clone())
    }

    pub fn new(admin_key: impl Into<String>) -> Self {
        Self {
            admin_key: admin_key.into(),
        }
    }

    /// A missing key never validates, not even against an empty secret.
    pub fn validate(&self, presented: Option<&str>) -> bool {
        presented.is_some_and(|key| key == self.admin_key)
    }

    /// Validate the `X-Admin-Key` header of a request.
    pub fn validate_headers(&self, headers: &HeaderMap) -> bool {
        self.validate(headers.get(ADMIN_KEY_HEADER).and_then(|v| v.to_str().ok()))
    }
}
