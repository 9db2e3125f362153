//! Same-origin proxy in front of the agent-session backend.
//!
//! Routes:
//!
//! ```text
//! GET  /api/browse     - local directory listing under the allow-list
//! ANY  /api/{*path}    - forwarded to the backend with `/api` stripped
//! ANY  /ws             - upgrade handshake forwarded to the backend, then spliced
//! *                    - static UI assets when a static dir is configured
//! ```

use axum::{
    Router,
    routing::{any, get},
};
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::{MakeSpan, TraceLayer};
use uuid::Uuid;

pub mod browse;
pub mod config;
pub mod error;
pub mod forward;
pub mod splice;
pub mod upgrade;

#[cfg(test)]
mod test_helpers;

use crate::browse::AllowList;
use crate::config::ProxyConfig;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    /// Forwarding client; never follows redirects.
    pub http: reqwest::Client,
    pub allow_list: Arc<AllowList>,
}

impl AppState {
    pub fn new(config: ProxyConfig) -> anyhow::Result<Self> {
        Ok(Self {
            allow_list: Arc::new(AllowList::new(config.allowed_roots.clone())),
            http: forward::forwarding_client()?,
            config: Arc::new(config),
        })
    }
}

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

pub fn router(state: AppState) -> Router {
    let static_dir = state.config.static_dir.clone();

    let app = Router::new()
        .route("/api/browse", get(browse::browse_handler))
        .route("/api/{*path}", any(forward::forward_handler))
        .route("/ws", any(upgrade::upgrade_handler));

    let app = match static_dir {
        Some(dir) => app.fallback_service(ServeDir::new(dir)),
        None => app,
    };

    app.layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .with_state(state)
}
