use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;

use crate::AppState;
use crate::browse::AllowList;
use crate::config::ProxyConfig;

/// Create a test AppState pointed at `backend_url`, whose browse allow-list is
/// a fresh temporary directory.
///
/// Returns the TempDir so the caller can keep it alive for the test's duration.
pub fn test_app_state(backend_url: &str) -> (AppState, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = ProxyConfig {
        listen: "127.0.0.1:0".parse().expect("listen addr"),
        backend: backend_url.parse().expect("backend url"),
        static_dir: None,
        allowed_roots: vec![tmp.path().to_path_buf()],
    };
    let state = AppState {
        allow_list: Arc::new(AllowList::new(config.allowed_roots.clone())),
        http: crate::forward::forwarding_client().expect("http client"),
        config: Arc::new(config),
    };
    (state, tmp)
}

/// Serve `app` on a loopback port and return its address.
pub async fn spawn_backend(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind backend");
    let addr = listener.local_addr().expect("backend addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Serve the full proxy router for `state` on a loopback port.
pub async fn spawn_proxy(state: AppState) -> SocketAddr {
    spawn_backend(crate::router(state)).await
}
