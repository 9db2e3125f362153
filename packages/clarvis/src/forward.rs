//! Pass-through of `/api/*` request/response traffic to the backend.

use axum::{
    body::{Body, HttpBody},
    extract::{Request, State},
    http::{Uri, header},
    response::{IntoResponse, Response},
};
use reqwest::Url;
use tracing::debug;

use crate::AppState;
use crate::error::ProxyError;

/// Client used for forwarded requests. Redirects are handed back to the
/// browser instead of being followed here.
pub fn forwarding_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

pub const API_PREFIX: &str = "/api";

/// `/api/{*path}`: the remainder after the prefix becomes the path on the
/// backend origin, query string included.
pub async fn forward_handler(State(state): State<AppState>, req: Request) -> Response {
    match forward(&state, req).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

/// Backend url for an inbound `/api/...` uri. Only path and query are taken
/// from the caller; scheme and authority always come from the configured
/// backend, so a path such as `//other-host/x` stays a path.
pub fn backend_url(backend: &Url, uri: &Uri) -> Url {
    let path = uri.path();
    let path = path.strip_prefix(API_PREFIX).unwrap_or(path);
    let mut url = backend.clone();
    url.set_path(if path.is_empty() { "/" } else { path });
    url.set_query(uri.query());
    url
}

async fn forward(state: &AppState, req: Request) -> Result<Response, ProxyError> {
    let (parts, body) = req.into_parts();
    let url = backend_url(&state.config.backend, &parts.uri);

    debug!("Forwarding {} {} -> {}", parts.method, parts.uri, url);

    let mut headers = parts.headers;
    // reqwest derives Host from the target url.
    headers.remove(header::HOST);

    let mut outbound = state.http.request(parts.method, url).headers(headers);
    if body.size_hint().exact() != Some(0) {
        outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }
    let upstream = outbound
        .send()
        .await
        .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;

    let mut builder = Response::builder().status(upstream.status());
    if let Some(out) = builder.headers_mut() {
        out.extend(upstream.headers().iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))
}
