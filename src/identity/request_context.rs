use axum::http::HeaderMap;

use crate::error::{AppError, AppResult};

pub const USER_HEADER: &str = "x-user-id";
pub const ISSUER_HEADER: &str = "x-issuer-id";

/// Caller identity as asserted by the fronting gateway.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub user_id: Option<String>,
    pub issuer_id: Option<String>,
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl RequestContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            user_id: header(headers, USER_HEADER),
            issuer_id: header(headers, ISSUER_HEADER),
        }
    }

    /// Linking endpoints report a missing user as a validation failure.
    pub fn require_user(&self) -> AppResult<&str> {
        self.user_id.as_deref().ok_or_else(|| AppError::missing_field(USER_HEADER))
    }

    pub fn require_issuer(&self) -> AppResult<&str> {
        self.issuer_id
            .as_deref()
            .ok_or_else(|| AppError::auth("missing_issuer", "missing issuer identity (x-issuer-id)"))
    }
}
