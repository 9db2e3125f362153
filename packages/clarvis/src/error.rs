use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Access denied: path outside allowed directories")]
    AccessDenied,
    #[error("Directory not found")]
    NotFound,
    /// Detail is logged, never sent to the caller.
    #[error("Backend unavailable")]
    BackendUnavailable(String),
    /// Detail is logged, never sent to the caller.
    #[error("Failed to read directory")]
    ReadFailed(#[from] std::io::Error),
    #[error("Upgrade failed: {0}")]
    UpgradeFailed(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::AccessDenied => StatusCode::FORBIDDEN,
            ProxyError::NotFound => StatusCode::NOT_FOUND,
            ProxyError::BackendUnavailable(_) | ProxyError::UpgradeFailed(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::ReadFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            ProxyError::BackendUnavailable(detail) => warn!("Backend unavailable: {}", detail),
            ProxyError::ReadFailed(e) => warn!("Directory listing failed: {}", e),
            ProxyError::UpgradeFailed(detail) => warn!("Upgrade failed: {}", detail),
            _ => {}
        }

        let mut response = (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response();
        // The caller's connection must not be reused after a failed handshake.
        if matches!(self, ProxyError::UpgradeFailed(_)) {
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
        response
    }
}
