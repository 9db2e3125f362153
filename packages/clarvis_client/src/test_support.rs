//! In-process stand-in for the agent-session backend, serving the `/api`
//! endpoints and the `/ws` event channel on a loopback port.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::api::BackendClient;
use crate::engine::EngineHandle;
use crate::events::ServerEvent;
use crate::state::SessionState;
use crate::types::{
    AttentionItem, AttentionKind, Message, PermissionMode, Session, SessionStatus,
};

pub const TEST_TOKEN: &str = "test-token";

#[derive(Default)]
struct Recorded {
    sessions: Vec<Session>,
    histories: HashMap<String, Vec<Message>>,
    attention: Vec<AttentionItem>,
    created_requests: Vec<Value>,
    sent: Vec<(String, String)>,
    resolutions: Vec<(String, Value)>,
    patches: Vec<(String, Value)>,
    interrupts: Vec<String>,
    subscribe_frames: Vec<Value>,
    fail_create: bool,
    fail_lists: bool,
    push_on_create: bool,
    echo_sends: bool,
    next_id: u64,
}

#[derive(Clone)]
struct Mock {
    inner: Arc<Mutex<Recorded>>,
    events: broadcast::Sender<String>,
}

impl Mock {
    fn with<T>(&self, f: impl FnOnce(&mut Recorded) -> T) -> T {
        f(&mut self.inner.lock().unwrap())
    }

    fn push(&self, event: &ServerEvent) {
        let _ = self.events.send(serde_json::to_string(event).unwrap());
    }
}

pub struct MockBackend {
    addr: SocketAddr,
    mock: Mock,
}

impl MockBackend {
    pub async fn start() -> Self {
        let (events, _) = broadcast::channel(64);
        let mock = Mock {
            inner: Arc::new(Mutex::new(Recorded::default())),
            events,
        };

        let api = Router::new()
            .route("/sessions", get(list_sessions).post(create_session))
            .route(
                "/sessions/{id}",
                get(get_session).delete(delete_session).patch(patch_session),
            )
            .route("/sessions/{id}/send", post(send_message))
            .route("/sessions/{id}/interrupt", post(interrupt))
            .route("/attention", get(list_attention))
            .route("/attention/{id}/resolve", post(resolve_attention))
            .route("/browse", get(browse))
            .route("/workdir/config", get(workdir_config))
            .layer(middleware::from_fn(require_token));

        let app = Router::new()
            .nest("/api", api)
            .route("/ws", get(ws_handler))
            .with_state(mock.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, mock }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn origin(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn client(&self) -> BackendClient {
        BackendClient::new(self.origin(), TEST_TOKEN)
    }

    /// A session fixture created well before anything made during a test.
    pub fn session(id: &str, workdir: &str) -> Session {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        Session {
            id: id.to_string(),
            workdir: workdir.to_string(),
            name: None,
            status: SessionStatus::Idle,
            config: Default::default(),
            created: at,
            modified: at,
            permission_mode: PermissionMode::Default,
            process: None,
            pending_for: None,
        }
    }

    pub fn attention(id: &str, session_id: &str) -> AttentionItem {
        AttentionItem {
            id: id.to_string(),
            session_id: session_id.to_string(),
            kind: AttentionKind::Permission,
            message: Some("Allow Bash?".into()),
            tool_name: Some("Bash".into()),
            tool_input: Some(json!({ "command": "ls" })),
            payload: None,
        }
    }

    pub fn add_session(&self, session: Session) {
        self.mock.with(|r| r.sessions.push(session));
    }

    pub fn add_history(&self, session_id: &str, messages: Vec<Message>) {
        self.mock
            .with(|r| r.histories.insert(session_id.to_string(), messages));
    }

    pub fn add_attention(&self, item: AttentionItem) {
        self.mock.with(|r| r.attention.push(item));
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.mock.with(|r| r.fail_create = fail);
    }

    pub fn set_fail_lists(&self, fail: bool) {
        self.mock.with(|r| r.fail_lists = fail);
    }

    /// Push `session:created` while handling `POST /sessions`.
    pub fn set_push_on_create(&self, push: bool) {
        self.mock.with(|r| r.push_on_create = push);
    }

    /// Echo sent messages back as a user message plus an assistant reply.
    pub fn set_echo_sends(&self, echo: bool) {
        self.mock.with(|r| r.echo_sends = echo);
    }

    pub fn push(&self, event: &ServerEvent) {
        self.mock.push(event);
    }

    pub fn push_raw(&self, frame: &str) {
        let _ = self.mock.events.send(frame.to_string());
    }

    pub fn created_requests(&self) -> Vec<Value> {
        self.mock.with(|r| r.created_requests.clone())
    }

    pub fn sent_messages(&self) -> Vec<(String, String)> {
        self.mock.with(|r| r.sent.clone())
    }

    pub fn resolutions(&self) -> Vec<(String, Value)> {
        self.mock.with(|r| r.resolutions.clone())
    }

    pub fn patches(&self) -> Vec<(String, Value)> {
        self.mock.with(|r| r.patches.clone())
    }

    pub fn interrupts(&self) -> Vec<String> {
        self.mock.with(|r| r.interrupts.clone())
    }

    pub fn subscribe_frames(&self) -> Vec<Value> {
        self.mock.with(|r| r.subscribe_frames.clone())
    }

    pub async fn wait_for_subscribers(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.subscribe_frames().len() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for subscribe frame");
    }
}

pub async fn wait_for_state(
    engine: &EngineHandle,
    predicate: impl FnMut(&Arc<SessionState>) -> bool,
) -> Arc<SessionState> {
    let mut changes = engine.changes();
    let state = tokio::time::timeout(Duration::from_secs(5), changes.wait_for(predicate))
        .await
        .expect("timed out waiting for engine state")
        .expect("engine stopped");
    state.clone()
}

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn require_token(req: Request, next: Next) -> Response {
    let expected = format!("Bearer {}", TEST_TOKEN);
    let authorized = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        == Some(expected.as_str());
    if !authorized {
        return error(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    next.run(req).await
}

async fn list_sessions(State(mock): State<Mock>) -> Response {
    mock.with(|r| {
        if r.fail_lists {
            return error(StatusCode::INTERNAL_SERVER_ERROR, "database unavailable");
        }
        Json(r.sessions.clone()).into_response()
    })
}

async fn get_session(State(mock): State<Mock>, Path(id): Path<String>) -> Response {
    mock.with(|r| match r.sessions.iter().find(|s| s.id == id) {
        Some(session) => {
            let mut body = serde_json::to_value(session).unwrap();
            body["messages"] = json!(r.histories.get(&id).cloned().unwrap_or_default());
            Json(body).into_response()
        }
        None => error(StatusCode::NOT_FOUND, "Session not found"),
    })
}

async fn create_session(State(mock): State<Mock>, Json(body): Json<Value>) -> Response {
    let created = mock.with(|r| {
        r.created_requests.push(body.clone());
        if r.fail_create {
            return None;
        }
        r.next_id += 1;
        let n = r.next_id;
        let now = Utc::now() + chrono::Duration::milliseconds(n as i64);
        let session = Session {
            id: format!("real-{}", n),
            workdir: body["workdir"].as_str().unwrap_or_default().to_string(),
            name: body["name"].as_str().map(str::to_string),
            status: SessionStatus::Running,
            config: Default::default(),
            created: now,
            modified: now,
            permission_mode: PermissionMode::Default,
            process: None,
            pending_for: None,
        };
        r.sessions.push(session.clone());
        Some((session, format!("backend_tmp_{}", n), r.push_on_create))
    });

    match created {
        Some((session, temp_id, push)) => {
            let name = session.name.clone();
            if push {
                mock.push(&ServerEvent::SessionCreated {
                    session,
                    temp_id: Some(temp_id.clone()),
                });
            }
            Json(json!({ "tempId": temp_id, "name": name })).into_response()
        }
        None => error(StatusCode::INTERNAL_SERVER_ERROR, "create failed"),
    }
}

async fn delete_session(State(mock): State<Mock>, Path(id): Path<String>) -> Response {
    mock.with(|r| {
        let before = r.sessions.len();
        r.sessions.retain(|s| s.id != id);
        if r.sessions.len() == before {
            return error(StatusCode::NOT_FOUND, "Session not found");
        }
        Json(json!({ "success": true })).into_response()
    })
}

async fn patch_session(
    State(mock): State<Mock>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    mock.with(|r| {
        r.patches.push((id.clone(), body.clone()));
        match r.sessions.iter_mut().find(|s| s.id == id) {
            Some(session) => {
                if let Some(name) = body["name"].as_str() {
                    session.name = Some(name.to_string());
                }
                Json(session.clone()).into_response()
            }
            None => error(StatusCode::NOT_FOUND, "Session not found"),
        }
    })
}

async fn send_message(
    State(mock): State<Mock>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let text = body["message"].as_str().unwrap_or_default().to_string();
    let echo = mock.with(|r| {
        r.sent.push((id.clone(), text.clone()));
        r.echo_sends
    });
    if echo {
        for (role, content) in [("user", text.clone()), ("assistant", format!("ack: {}", text))] {
            let message: Message =
                serde_json::from_value(json!({ "role": role, "content": content })).unwrap();
            mock.push(&ServerEvent::SessionMessage {
                session_id: id.clone(),
                message,
            });
        }
    }
    Json(json!({ "success": true })).into_response()
}

async fn interrupt(State(mock): State<Mock>, Path(id): Path<String>) -> Response {
    mock.with(|r| r.interrupts.push(id));
    Json(json!({ "success": true })).into_response()
}

async fn list_attention(State(mock): State<Mock>) -> Response {
    mock.with(|r| {
        if r.fail_lists {
            return error(StatusCode::INTERNAL_SERVER_ERROR, "database unavailable");
        }
        Json(r.attention.clone()).into_response()
    })
}

async fn resolve_attention(
    State(mock): State<Mock>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    mock.with(|r| r.resolutions.push((id, body)));
    Json(json!({ "success": true })).into_response()
}

async fn browse(Query(query): Query<HashMap<String, String>>) -> Response {
    let path = query.get("path").cloned();
    Json(json!({
        "entries": [],
        "path": path.clone().unwrap_or_default(),
        "isRoot": path.is_none(),
    }))
    .into_response()
}

async fn workdir_config(Query(query): Query<HashMap<String, String>>) -> Response {
    Json(json!({
        "effective": { "workdir": query.get("path").cloned().unwrap_or_default() }
    }))
    .into_response()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(mock): State<Mock>,
) -> Response {
    if query.get("token").map(String::as_str) != Some(TEST_TOKEN) {
        return error(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    ws.on_upgrade(move |socket| serve_socket(socket, mock))
}

async fn serve_socket(socket: WebSocket, mock: Mock) {
    let (mut sink, mut stream) = socket.split();
    let mut pushes = mock.events.subscribe();

    if let Some(Ok(WsMessage::Text(text))) = stream.next().await {
        let frame: Value = serde_json::from_str(text.as_str()).unwrap_or(Value::Null);
        mock.with(|r| r.subscribe_frames.push(frame));
    }

    loop {
        tokio::select! {
            push = pushes.recv() => match push {
                Ok(frame) => {
                    if sink.send(WsMessage::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
