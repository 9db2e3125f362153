//! Forwarding of the `/ws` upgrade handshake to the backend's event channel.
//!
//! The proxy never speaks the upgraded protocol. It replays the caller's
//! handshake against the backend over a fresh HTTP/1.1 connection, mirrors
//! the backend's answer, and, on acceptance, splices the two raw streams.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::AppState;
use crate::error::ProxyError;
use crate::splice::splice;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of one proxied upgrade.
///
/// ```text
/// Pending ─┬─> AcceptedByBackend ─> Splicing ───────> Closed
///          ├─> RejectedByBackend ─> RelayedResponse ─> Closed
///          └─> TransportError ──────────────────────> Closed
/// ```
///
/// `Closed` is reachable from every other phase and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradePhase {
    Pending,
    AcceptedByBackend,
    Splicing,
    RejectedByBackend,
    RelayedResponse,
    TransportError,
    Closed,
}

impl UpgradePhase {
    pub fn can_advance_to(self, next: UpgradePhase) -> bool {
        use UpgradePhase::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Pending, AcceptedByBackend | RejectedByBackend | TransportError) => true,
            (AcceptedByBackend, Splicing) => true,
            (RejectedByBackend, RelayedResponse) => true,
            _ => false,
        }
    }
}

/// Tracks one upgrade through its phases, tagging log lines with a
/// connection id.
#[derive(Debug)]
pub struct UpgradeConnection {
    id: Uuid,
    phase: UpgradePhase,
}

impl Default for UpgradeConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl UpgradeConnection {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            phase: UpgradePhase::Pending,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> UpgradePhase {
        self.phase
    }

    /// Moves to `next` if the transition is legal. Illegal transitions are
    /// logged and leave the phase unchanged.
    pub fn advance(&mut self, next: UpgradePhase) -> bool {
        if !self.phase.can_advance_to(next) {
            warn!(
                connection = %self.id,
                "Ignoring upgrade transition {:?} -> {:?}", self.phase, next
            );
            return false;
        }
        debug!(connection = %self.id, "Upgrade {:?} -> {:?}", self.phase, next);
        self.phase = next;
        true
    }
}

/// Backend request target for an inbound upgrade: the backend serves its
/// event channel at `/`, authenticated by the same `token` query value. The
/// value is passed on still percent-encoded.
pub fn backend_target(uri: &Uri) -> String {
    let token = uri
        .query()
        .unwrap_or_default()
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .unwrap_or_default();
    format!("/?token={}", token)
}

/// `/ws`
pub async fn upgrade_handler(State(state): State<AppState>, mut req: Request) -> Response {
    let mut conn = UpgradeConnection::new();
    let client_upgrade = hyper::upgrade::on(&mut req);
    let (parts, _) = req.into_parts();
    debug!(connection = %conn.id(), "Upgrade request {}", parts.uri.path());

    let backend_resp = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&state, &parts)).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            conn.advance(UpgradePhase::TransportError);
            conn.advance(UpgradePhase::Closed);
            return e.into_response();
        }
        Err(_) => {
            conn.advance(UpgradePhase::TransportError);
            conn.advance(UpgradePhase::Closed);
            return ProxyError::UpgradeFailed("backend handshake timed out".into()).into_response();
        }
    };

    if backend_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        conn.advance(UpgradePhase::RejectedByBackend);
        debug!(
            connection = %conn.id(),
            "Backend declined upgrade with {}", backend_resp.status()
        );
        let (parts, body) = backend_resp.into_parts();
        conn.advance(UpgradePhase::RelayedResponse);
        conn.advance(UpgradePhase::Closed);
        return Response::from_parts(parts, Body::new(body));
    }

    conn.advance(UpgradePhase::AcceptedByBackend);

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *response.headers_mut() = backend_resp.headers().clone();

    let backend_upgrade = hyper::upgrade::on(backend_resp);
    tokio::spawn(async move {
        // The caller side completes once the 101 below has been written.
        // Bytes the backend sent along with its handshake stay buffered inside
        // its `Upgraded` and are read out first.
        let (client_io, backend_io) = match tokio::try_join!(client_upgrade, backend_upgrade) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(connection = %conn.id(), "Upgrade did not complete: {}", e);
                conn.advance(UpgradePhase::Closed);
                return;
            }
        };

        conn.advance(UpgradePhase::Splicing);
        let stats = splice(TokioIo::new(client_io), TokioIo::new(backend_io)).await;
        debug!(
            connection = %conn.id(),
            "Spliced {} bytes to backend, {} bytes to caller", stats.a_to_b, stats.b_to_a
        );
        conn.advance(UpgradePhase::Closed);
    });

    response
}

/// Replays the caller's handshake against the backend with the `Host` header
/// rewritten. The backend connection is driven with upgrades enabled.
async fn handshake(
    state: &AppState,
    req: &axum::http::request::Parts,
) -> Result<hyper::Response<Incoming>, ProxyError> {
    let authority = state.config.backend_authority();
    let stream = TcpStream::connect(&authority)
        .await
        .map_err(|e| ProxyError::UpgradeFailed(format!("connect {}: {}", authority, e)))?;

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| ProxyError::UpgradeFailed(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = connection.with_upgrades().await {
            debug!("Backend connection ended: {}", e);
        }
    });

    let target = backend_target(&req.uri)
        .parse::<Uri>()
        .map_err(|e| ProxyError::UpgradeFailed(e.to_string()))?;
    let host =
        HeaderValue::from_str(&authority).map_err(|e| ProxyError::UpgradeFailed(e.to_string()))?;

    let mut outbound = hyper::Request::new(Body::empty());
    *outbound.method_mut() = req.method.clone();
    *outbound.uri_mut() = target;
    *outbound.headers_mut() = req.headers.clone();
    outbound.headers_mut().insert(header::HOST, host);

    sender
        .send_request(outbound)
        .await
        .map_err(|e| ProxyError::UpgradeFailed(e.to_string()))
}
