//! Session synchronization engine.
//!
//! A single actor task owns the [`SessionState`]. It reacts to three input
//! sources one at a time: commands from [`EngineHandle`]s, frames from the
//! event channel, and completions of the HTTP calls it spawned. After every
//! input it publishes a fresh snapshot on a `watch` channel.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::api::BackendClient;
use crate::channel::EventChannel;
use crate::content::derive_session_name;
use crate::creation::PendingCreation;
use crate::error::ClientError;
use crate::events::ChannelEvent;
use crate::state::{LOGIN_ERROR, SessionState, parse_address};
use crate::storage::{KeyValueStore, keys, load_json, remove_key, save_json};
use crate::types::{
    AttentionItem, AttentionResolution, BrowseResponse, CreateSessionRequest,
    CreateSessionResponse, PENDING_ID_PREFIX, PermissionMode, Resolution, Session,
    SessionConfig, SessionDetail, WorkdirConfig,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Origin of the proxy serving `/api` and `/ws`.
    #[serde(default = "default_origin")]
    pub origin: String,
    #[serde(default = "default_refresh_delay_ms")]
    pub creation_refresh_delay_ms: u64,
    #[serde(default = "default_max_name_length")]
    pub max_session_name_length: usize,
    #[serde(default = "default_visible_sessions")]
    pub default_visible_sessions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            creation_refresh_delay_ms: default_refresh_delay_ms(),
            max_session_name_length: default_max_name_length(),
            default_visible_sessions: default_visible_sessions(),
        }
    }
}

fn default_origin() -> String {
    "http://127.0.0.1:3000".to_string()
}
fn default_refresh_delay_ms() -> u64 {
    2000
}
fn default_max_name_length() -> usize {
    128
}
fn default_visible_sessions() -> usize {
    5
}

/// Arguments for [`EngineHandle::create_session`].
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub workdir: String,
    pub prompt: Option<String>,
    pub name: Option<String>,
    pub permission_mode: Option<PermissionMode>,
}

type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

enum EngineCommand {
    Connect {
        token: String,
        respond_to: oneshot::Sender<()>,
    },
    Disconnect {
        respond_to: oneshot::Sender<()>,
    },
    Select {
        session_id: String,
        respond_to: oneshot::Sender<()>,
    },
    Navigate {
        address: String,
        respond_to: oneshot::Sender<()>,
    },
    Create {
        request: NewSession,
        respond_to: Reply<String>,
    },
    Delete {
        session_id: String,
        respond_to: Reply<()>,
    },
    Rename {
        session_id: String,
        name: String,
        respond_to: Reply<()>,
    },
    SetPermissionMode {
        session_id: String,
        mode: PermissionMode,
        respond_to: Reply<()>,
    },
    Refresh {
        respond_to: oneshot::Sender<()>,
    },
    SendMessage {
        text: String,
        respond_to: Reply<()>,
    },
    ResolveAttention {
        attention_id: String,
        resolution: AttentionResolution,
        respond_to: Reply<()>,
    },
    Interrupt {
        session_id: String,
        respond_to: Reply<()>,
    },
    Browse {
        path: Option<String>,
        respond_to: Reply<BrowseResponse>,
    },
    WorkdirConfig {
        workdir: String,
        respond_to: Reply<WorkdirConfig>,
    },
}

type Snapshot = Result<(Vec<Session>, Vec<AttentionItem>), ClientError>;

enum Completion {
    Bootstrap(Snapshot),
    Refreshed {
        result: Snapshot,
        respond_to: oneshot::Sender<()>,
    },
    History {
        session_id: String,
        result: Result<SessionDetail, ClientError>,
    },
    Created {
        temp_id: String,
        result: Result<CreateSessionResponse, ClientError>,
    },
    CreationRefresh {
        temp_id: String,
        result: Result<Vec<Session>, ClientError>,
    },
    Deleted {
        session_id: String,
        result: Result<(), ClientError>,
        respond_to: Reply<()>,
    },
    Renamed {
        session_id: String,
        name: String,
        result: Result<(), ClientError>,
        respond_to: Reply<()>,
    },
    PermissionModeSet {
        session_id: String,
        mode: PermissionMode,
        result: Result<(), ClientError>,
        respond_to: Reply<()>,
    },
    Sent {
        session_id: String,
        text: String,
        result: Result<(), ClientError>,
        respond_to: Reply<()>,
    },
}

/// Completion tagged with the connection it was started under.
struct Tagged {
    generation: u64,
    completion: Completion,
}

/// Per-connection resources. Built on connect, dropped on disconnect.
struct EngineContext {
    client: BackendClient,
    _channel: EventChannel,
}

struct EngineActor {
    config: EngineConfig,
    store: Arc<dyn KeyValueStore>,
    http: reqwest::Client,
    state: SessionState,
    context: Option<EngineContext>,
    generation: u64,
    /// Session id carried by the current navigable address.
    address_id: Option<String>,
    /// Active session as of the last publish.
    published_active: Option<String>,
    last_temp_millis: i64,
    commands: mpsc::Receiver<EngineCommand>,
    events: Option<mpsc::Receiver<ChannelEvent>>,
    completions_tx: mpsc::UnboundedSender<Tagged>,
    completions_rx: mpsc::UnboundedReceiver<Tagged>,
    snapshots: watch::Sender<Arc<SessionState>>,
}

/// Handle to the engine actor. Cheap to clone.
#[derive(Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<EngineCommand>,
    snapshots: watch::Receiver<Arc<SessionState>>,
    store: Arc<dyn KeyValueStore>,
}

impl EngineHandle {
    /// Spawn the engine. `address` is the navigable address the UI started
    /// on, e.g. `#session=abc`.
    pub fn spawn(
        config: EngineConfig,
        store: Arc<dyn KeyValueStore>,
        address: Option<&str>,
    ) -> Self {
        let (sender, commands) = mpsc::channel(64);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (snapshots, snapshot_rx) = watch::channel(Arc::new(SessionState::new()));

        let actor = EngineActor {
            config,
            store: store.clone(),
            http: reqwest::Client::new(),
            state: SessionState::new(),
            context: None,
            generation: 0,
            address_id: address.and_then(parse_address),
            published_active: None,
            last_temp_millis: 0,
            commands,
            events: None,
            completions_tx,
            completions_rx,
            snapshots,
        };
        tokio::spawn(actor.run());

        Self {
            sender,
            snapshots: snapshot_rx,
            store,
        }
    }

    /// Latest published snapshot.
    pub fn state(&self) -> Arc<SessionState> {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified after every input the engine handles.
    pub fn changes(&self) -> watch::Receiver<Arc<SessionState>> {
        self.snapshots.clone()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| ClientError::EngineStopped)?;
        rx.await.map_err(|_| ClientError::EngineStopped)
    }

    /// Connect with `token`, replacing any existing connection. The token is
    /// persisted for [`resume`](Self::resume).
    pub async fn connect(&self, token: &str) -> Result<(), ClientError> {
        self.request(|respond_to| EngineCommand::Connect {
            token: token.to_string(),
            respond_to,
        })
        .await
    }

    /// Connect with the persisted token, if there is one.
    pub async fn resume(&self) -> Result<bool, ClientError> {
        let token: String = load_json(self.store.as_ref(), keys::TOKEN, String::new());
        if token.is_empty() {
            return Ok(false);
        }
        self.connect(&token).await?;
        Ok(true)
    }

    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.request(|respond_to| EngineCommand::Disconnect { respond_to })
            .await
    }

    /// Make `session_id` active and load its history if not loaded yet.
    pub async fn select_session(&self, session_id: &str) -> Result<(), ClientError> {
        self.request(|respond_to| EngineCommand::Select {
            session_id: session_id.to_string(),
            respond_to,
        })
        .await
    }

    /// Follow an address change from outside (back/forward navigation).
    pub async fn navigate(&self, address: &str) -> Result<(), ClientError> {
        self.request(|respond_to| EngineCommand::Navigate {
            address: address.to_string(),
            respond_to,
        })
        .await
    }

    /// Start creating a session. Returns the placeholder id once the
    /// placeholder is visible; the backend call completes in the background.
    pub async fn create_session(&self, request: NewSession) -> Result<String, ClientError> {
        self.request(|respond_to| EngineCommand::Create {
            request,
            respond_to,
        })
        .await?
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), ClientError> {
        self.request(|respond_to| EngineCommand::Delete {
            session_id: session_id.to_string(),
            respond_to,
        })
        .await?
    }

    pub async fn rename_session(&self, session_id: &str, name: &str) -> Result<(), ClientError> {
        self.request(|respond_to| EngineCommand::Rename {
            session_id: session_id.to_string(),
            name: name.to_string(),
            respond_to,
        })
        .await?
    }

    pub async fn update_permission_mode(
        &self,
        session_id: &str,
        mode: PermissionMode,
    ) -> Result<(), ClientError> {
        self.request(|respond_to| EngineCommand::SetPermissionMode {
            session_id: session_id.to_string(),
            mode,
            respond_to,
        })
        .await?
    }

    /// Reload sessions and attention. Ignored while a refresh is running.
    pub async fn refresh(&self) -> Result<(), ClientError> {
        self.request(|respond_to| EngineCommand::Refresh { respond_to })
            .await
    }

    /// Send to the active session. Blank text or no active session is a no-op.
    pub async fn send_message(&self, text: &str) -> Result<(), ClientError> {
        self.request(|respond_to| EngineCommand::SendMessage {
            text: text.to_string(),
            respond_to,
        })
        .await?
    }

    /// Resolve an attention item. The item stays until the backend pushes
    /// `attention:resolved`.
    pub async fn resolve_attention(
        &self,
        attention_id: &str,
        behavior: Resolution,
        message: Option<&str>,
    ) -> Result<(), ClientError> {
        let resolution = AttentionResolution {
            behavior,
            message: message.filter(|m| !m.is_empty()).map(str::to_string),
        };
        self.request(|respond_to| EngineCommand::ResolveAttention {
            attention_id: attention_id.to_string(),
            resolution,
            respond_to,
        })
        .await?
    }

    pub async fn interrupt_session(&self, session_id: &str) -> Result<(), ClientError> {
        self.request(|respond_to| EngineCommand::Interrupt {
            session_id: session_id.to_string(),
            respond_to,
        })
        .await?
    }

    pub async fn browse(&self, path: Option<&str>) -> Result<BrowseResponse, ClientError> {
        self.request(|respond_to| EngineCommand::Browse {
            path: path.map(str::to_string),
            respond_to,
        })
        .await?
    }

    pub async fn workdir_config(&self, workdir: &str) -> Result<WorkdirConfig, ClientError> {
        self.request(|respond_to| EngineCommand::WorkdirConfig {
            workdir: workdir.to_string(),
            respond_to,
        })
        .await?
    }
}

async fn next_channel_event(
    events: &mut Option<mpsc::Receiver<ChannelEvent>>,
) -> Option<ChannelEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn fetch_snapshot(client: BackendClient) -> Snapshot {
    tokio::try_join!(client.list_sessions(), client.list_attention())
}

impl EngineActor {
    async fn run(mut self) {
        debug!("Session engine started");
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(tagged) = self.completions_rx.recv() => self.handle_completion(tagged),
                event = next_channel_event(&mut self.events) => match event {
                    Some(event) => self.handle_channel_event(event),
                    None => self.events = None,
                },
            }
            self.publish();
        }
        debug!("Session engine stopped");
    }

    fn client(&self) -> Option<BackendClient> {
        self.context.as_ref().map(|ctx| ctx.client.clone())
    }

    fn spawn_task<F>(&self, fut: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let tx = self.completions_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let completion = fut.await;
            let _ = tx.send(Tagged {
                generation,
                completion,
            });
        });
    }

    /// Spawn `call` and reply with its result, without touching state.
    fn passthrough<T, F>(&self, respond_to: Reply<T>, call: impl FnOnce(BackendClient) -> F)
    where
        T: Send + 'static,
        F: Future<Output = Result<T, ClientError>> + Send + 'static,
    {
        match self.client() {
            Some(client) => {
                let fut = call(client);
                tokio::spawn(async move {
                    let _ = respond_to.send(fut.await);
                });
            }
            None => {
                let _ = respond_to.send(Err(ClientError::NotConnected));
            }
        }
    }

    /// Persist the active pointer if it moved and hand observers a snapshot.
    /// Commands that reply with a state change call this before replying.
    fn publish(&mut self) {
        if self.state.active_session_id != self.published_active {
            match &self.state.active_session_id {
                Some(id) => save_json(self.store.as_ref(), keys::ACTIVE_SESSION, id),
                None => remove_key(self.store.as_ref(), keys::ACTIVE_SESSION),
            }
            self.published_active = self.state.active_session_id.clone();
            self.address_id = self.published_active.clone();
        }
        self.snapshots.send_replace(Arc::new(self.state.clone()));
    }

    fn next_temp_id(&mut self) -> String {
        let millis = Utc::now().timestamp_millis().max(self.last_temp_millis + 1);
        self.last_temp_millis = millis;
        format!("{}{}", PENDING_ID_PREFIX, millis)
    }

    fn load_history_if_missing(&self, session_id: &str) {
        if self.state.has_history(session_id) || session_id.starts_with(PENDING_ID_PREFIX) {
            return;
        }
        let Some(client) = self.client() else {
            return;
        };
        let session_id = session_id.to_string();
        self.spawn_task(async move {
            let result = client.get_session(&session_id).await;
            Completion::History { session_id, result }
        });
    }

    fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Connect { token, respond_to } => {
                self.connect(token);
                self.publish();
                let _ = respond_to.send(());
            }

            EngineCommand::Disconnect { respond_to } => {
                self.teardown();
                self.publish();
                let _ = respond_to.send(());
            }

            EngineCommand::Select {
                session_id,
                respond_to,
            } => {
                self.state.active_session_id = Some(session_id.clone());
                self.state.awaiting_response = false;
                self.load_history_if_missing(&session_id);
                self.publish();
                let _ = respond_to.send(());
            }

            EngineCommand::Navigate {
                address,
                respond_to,
            } => {
                match parse_address(&address) {
                    Some(id) if self.state.active_session_id.as_deref() != Some(id.as_str()) => {
                        self.state.active_session_id = Some(id.clone());
                        self.load_history_if_missing(&id);
                    }
                    Some(_) => {}
                    None => self.state.active_session_id = None,
                }
                self.publish();
                let _ = respond_to.send(());
            }

            EngineCommand::Create {
                request,
                respond_to,
            } => {
                let result = self.create_session(request);
                self.publish();
                let _ = respond_to.send(result);
            }

            EngineCommand::Delete {
                session_id,
                respond_to,
            } => {
                let Some(client) = self.client() else {
                    let _ = respond_to.send(Err(ClientError::NotConnected));
                    return;
                };
                self.spawn_task(async move {
                    let result = client.delete_session(&session_id).await;
                    Completion::Deleted {
                        session_id,
                        result,
                        respond_to,
                    }
                });
            }

            EngineCommand::Rename {
                session_id,
                name,
                respond_to,
            } => {
                let Some(client) = self.client() else {
                    let _ = respond_to.send(Err(ClientError::NotConnected));
                    return;
                };
                self.spawn_task(async move {
                    let result = client.rename_session(&session_id, &name).await;
                    Completion::Renamed {
                        session_id,
                        name,
                        result,
                        respond_to,
                    }
                });
            }

            EngineCommand::SetPermissionMode {
                session_id,
                mode,
                respond_to,
            } => {
                let Some(client) = self.client() else {
                    let _ = respond_to.send(Err(ClientError::NotConnected));
                    return;
                };
                self.spawn_task(async move {
                    let result = client
                        .update_session(&session_id, serde_json::json!({ "permissionMode": mode }))
                        .await;
                    Completion::PermissionModeSet {
                        session_id,
                        mode,
                        result,
                        respond_to,
                    }
                });
            }

            EngineCommand::Refresh { respond_to } => {
                let client = match self.client() {
                    Some(client) if !self.state.is_refreshing => client,
                    _ => {
                        let _ = respond_to.send(());
                        return;
                    }
                };
                self.state.is_refreshing = true;
                self.spawn_task(async move {
                    Completion::Refreshed {
                        result: fetch_snapshot(client).await,
                        respond_to,
                    }
                });
            }

            EngineCommand::SendMessage { text, respond_to } => {
                let (Some(session_id), Some(client)) =
                    (self.state.active_session_id.clone(), self.client())
                else {
                    let _ = respond_to.send(Ok(()));
                    return;
                };
                if text.trim().is_empty() {
                    let _ = respond_to.send(Ok(()));
                    return;
                }
                self.state.push_optimistic(&session_id, &text);
                self.spawn_task(async move {
                    let result = client.send_message(&session_id, &text).await;
                    Completion::Sent {
                        session_id,
                        text,
                        result,
                        respond_to,
                    }
                });
            }

            EngineCommand::ResolveAttention {
                attention_id,
                resolution,
                respond_to,
            } => self.passthrough(respond_to, |client| async move {
                client.resolve_attention(&attention_id, &resolution).await
            }),

            EngineCommand::Interrupt {
                session_id,
                respond_to,
            } => self.passthrough(respond_to, |client| async move {
                client.interrupt_session(&session_id).await
            }),

            EngineCommand::Browse { path, respond_to } => {
                self.passthrough(respond_to, |client| async move {
                    client.browse(path.as_deref()).await
                })
            }

            EngineCommand::WorkdirConfig {
                workdir,
                respond_to,
            } => self.passthrough(respond_to, |client| async move {
                client.workdir_config(&workdir).await
            }),
        }
    }

    fn connect(&mut self, token: String) {
        if token.is_empty() {
            debug!("Ignoring connect without a token");
            return;
        }
        self.teardown();
        self.state.login_error = None;
        save_json(self.store.as_ref(), keys::TOKEN, &token);

        let client = BackendClient::with_http(self.http.clone(), self.config.origin.clone(), token);
        let url = match client.events_url() {
            Ok(url) => url,
            Err(e) => {
                warn!("Cannot open event channel: {}", e);
                self.state.login_error = Some(LOGIN_ERROR.to_string());
                return;
            }
        };
        let (channel, events) = EventChannel::open(url);
        self.events = Some(events);
        self.context = Some(EngineContext {
            client,
            _channel: channel,
        });
        info!("Connecting to {}", self.config.origin);
    }

    fn teardown(&mut self) {
        if self.context.take().is_some() {
            debug!("Closing connection context");
        }
        self.events = None;
        self.generation += 1;
        self.state.connected = false;
        self.state.is_refreshing = false;
    }

    fn create_session(&mut self, request: NewSession) -> Result<String, ClientError> {
        let client = self.client().ok_or(ClientError::NotConnected)?;
        let NewSession {
            workdir,
            prompt,
            name,
            permission_mode,
        } = request;

        let prompt = prompt.filter(|p| !p.trim().is_empty());
        let name = name.filter(|n| !n.trim().is_empty()).or_else(|| {
            prompt
                .as_deref()
                .and_then(|p| derive_session_name(p, self.config.max_session_name_length))
        });
        let mode = permission_mode.unwrap_or_default();
        let config = (mode != PermissionMode::Default).then(|| SessionConfig {
            permission_mode: Some(mode),
        });

        let temp_id = self.next_temp_id();
        let now = Utc::now();
        let placeholder = Session::placeholder(temp_id.clone(), &workdir, name.clone(), mode, now);
        self.state.begin_creation(
            placeholder,
            PendingCreation::new(temp_id.clone(), workdir.clone(), now),
        );

        let body = CreateSessionRequest {
            workdir,
            prompt,
            name,
            config,
        };
        let id = temp_id.clone();
        self.spawn_task(async move {
            let result = client.create_session(&body).await;
            Completion::Created {
                temp_id: id,
                result,
            }
        });
        Ok(temp_id)
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => {
                info!("Event channel connected");
                self.state.connected = true;
                self.state.login_error = None;
                if let Some(client) = self.client() {
                    self.spawn_task(async move { Completion::Bootstrap(fetch_snapshot(client).await) });
                }
            }
            ChannelEvent::Disconnected => {
                info!("Event channel disconnected");
                self.state.connected = false;
            }
            ChannelEvent::Error(e) => {
                warn!("Event channel error: {}", e);
                self.state.login_error = Some(LOGIN_ERROR.to_string());
            }
            ChannelEvent::Server(event) => self.state.apply_event(event),
        }
    }

    fn handle_completion(&mut self, tagged: Tagged) {
        let current = tagged.generation == self.generation;
        match tagged.completion {
            Completion::Bootstrap(result) => {
                if !current {
                    return;
                }
                match result {
                    Ok((sessions, attention)) => {
                        self.state.load_snapshot(sessions, attention);
                        self.restore_active();
                    }
                    Err(e) => warn!("Failed to load sessions: {}", e),
                }
            }

            Completion::Refreshed { result, respond_to } => {
                if current {
                    self.state.is_refreshing = false;
                    match result {
                        Ok((sessions, attention)) => self.state.load_snapshot(sessions, attention),
                        Err(e) => warn!("Failed to refresh sessions: {}", e),
                    }
                }
                self.publish();
                let _ = respond_to.send(());
            }

            Completion::History { session_id, result } => match result {
                Ok(detail) => {
                    if let Some(messages) = detail.messages {
                        self.state.set_history(&session_id, messages);
                    }
                }
                Err(e) => warn!("Failed to load session history for {}: {}", session_id, e),
            },

            Completion::Created { temp_id, result } => match result {
                Ok(response) => {
                    self.state.record_creation_ack(&temp_id, &response);
                    let Some(client) = self.client() else {
                        return;
                    };
                    let delay = Duration::from_millis(self.config.creation_refresh_delay_ms);
                    self.spawn_task(async move {
                        tokio::time::sleep(delay).await;
                        Completion::CreationRefresh {
                            temp_id,
                            result: client.list_sessions().await,
                        }
                    });
                }
                Err(e) => {
                    warn!("Failed to create session on backend: {}", e);
                    self.state.fail_creation(&temp_id);
                }
            },

            Completion::CreationRefresh { temp_id, result } => match result {
                Ok(sessions) => self.state.resolve_creation(&temp_id, sessions),
                Err(e) => warn!("Failed to refresh sessions after create: {}", e),
            },

            Completion::Deleted {
                session_id,
                result,
                respond_to,
            } => {
                match &result {
                    Ok(()) => self.state.remove_session(&session_id),
                    Err(e) => warn!("Failed to delete session {}: {}", session_id, e),
                }
                self.publish();
                let _ = respond_to.send(result);
            }

            Completion::Renamed {
                session_id,
                name,
                result,
                respond_to,
            } => {
                if result.is_ok() {
                    self.state.rename_local(&session_id, &name);
                }
                self.publish();
                let _ = respond_to.send(result);
            }

            Completion::PermissionModeSet {
                session_id,
                mode,
                result,
                respond_to,
            } => {
                match &result {
                    Ok(()) => self.state.set_permission_mode_local(&session_id, mode),
                    Err(e) => warn!("Failed to update permission mode: {}", e),
                }
                self.publish();
                let _ = respond_to.send(result);
            }

            Completion::Sent {
                session_id,
                text,
                result,
                respond_to,
            } => {
                if let Err(e) = &result {
                    warn!("Failed to send message to {}: {}", session_id, e);
                    self.state.drop_optimistic(&session_id, &text);
                }
                self.publish();
                let _ = respond_to.send(result);
            }
        }
    }

    /// After bootstrap: activate the session named by the address, else the
    /// persisted one, if it exists.
    fn restore_active(&mut self) {
        let persisted: Option<String> =
            load_json(self.store.as_ref(), keys::ACTIVE_SESSION, None);
        let Some(id) = self.address_id.clone().or(persisted) else {
            return;
        };
        if self.state.session(&id).is_none() {
            debug!("Stored active session {} no longer exists", id);
            return;
        }
        self.state.active_session_id = Some(id.clone());
        self.load_history_if_missing(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ServerEvent;
    use crate::storage::MemoryStore;
    use crate::test_support::{MockBackend, TEST_TOKEN, wait_for_state};
    use crate::types::{AttentionKind, Message, MessageRole};

    fn engine_for(backend: &MockBackend, store: Arc<MemoryStore>, address: Option<&str>) -> EngineHandle {
        let config = EngineConfig {
            origin: backend.origin(),
            creation_refresh_delay_ms: 50,
            ..EngineConfig::default()
        };
        EngineHandle::spawn(config, store, address)
    }

    async fn connected_engine(backend: &MockBackend) -> EngineHandle {
        let engine = engine_for(backend, Arc::new(MemoryStore::new()), None);
        engine.connect(TEST_TOKEN).await.unwrap();
        wait_for_state(&engine, |s| s.connected()).await;
        backend.wait_for_subscribers(1).await;
        engine
    }

    #[test]
    fn config_defaults_from_empty_json() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.creation_refresh_delay_ms, 2000);
        assert_eq!(config.max_session_name_length, 128);
        assert_eq!(config.default_visible_sessions, 5);
    }

    #[tokio::test]
    async fn connect_bootstraps_and_restores_persisted_session() {
        let backend = MockBackend::start().await;
        backend.add_session(MockBackend::session("s1", "/w"));
        backend.add_session(MockBackend::session("s2", "/w"));
        backend.add_history("s2", vec![Message::optimistic_user("old")]);
        backend.add_attention(MockBackend::attention("a1", "s1"));

        let store = Arc::new(MemoryStore::new());
        save_json(store.as_ref(), keys::ACTIVE_SESSION, "s2");
        let engine = engine_for(&backend, store.clone(), None);
        engine.connect(TEST_TOKEN).await.unwrap();

        let state = wait_for_state(&engine, |s| s.has_history("s2")).await;
        assert!(state.connected());
        assert_eq!(state.sessions().len(), 2);
        assert_eq!(state.attention().len(), 1);
        assert_eq!(state.active_session_id(), Some("s2"));
        assert_eq!(state.active_messages().len(), 1);
        assert_eq!(state.address(), "#session=s2");
        assert_eq!(backend.subscribe_frames()[0]["type"], "subscribe");

        let token: String = load_json(store.as_ref(), keys::TOKEN, String::new());
        assert_eq!(token, TEST_TOKEN);
    }

    #[tokio::test]
    async fn address_wins_over_persisted_session() {
        let backend = MockBackend::start().await;
        backend.add_session(MockBackend::session("s1", "/w"));
        backend.add_session(MockBackend::session("s2", "/w"));

        let store = Arc::new(MemoryStore::new());
        save_json(store.as_ref(), keys::ACTIVE_SESSION, "s2");
        let engine = engine_for(&backend, store.clone(), Some("#session=s1"));
        engine.connect(TEST_TOKEN).await.unwrap();

        let state = wait_for_state(&engine, |s| s.active_session_id().is_some()).await;
        assert_eq!(state.active_session_id(), Some("s1"));
        let persisted: Option<String> = load_json(store.as_ref(), keys::ACTIVE_SESSION, None);
        assert_eq!(persisted.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn unknown_persisted_session_is_not_activated() {
        let backend = MockBackend::start().await;
        backend.add_session(MockBackend::session("s1", "/w"));
        let store = Arc::new(MemoryStore::new());
        save_json(store.as_ref(), keys::ACTIVE_SESSION, "gone");
        let engine = engine_for(&backend, store, None);
        engine.connect(TEST_TOKEN).await.unwrap();

        let state = wait_for_state(&engine, |s| !s.sessions().is_empty()).await;
        assert_eq!(state.active_session_id(), None);
    }

    #[tokio::test]
    async fn resume_uses_stored_token() {
        let backend = MockBackend::start().await;
        let store = Arc::new(MemoryStore::new());
        let engine = engine_for(&backend, store.clone(), None);
        assert!(!engine.resume().await.unwrap());

        save_json(store.as_ref(), keys::TOKEN, TEST_TOKEN);
        assert!(engine.resume().await.unwrap());
        wait_for_state(&engine, |s| s.connected()).await;
    }

    #[tokio::test]
    async fn bad_token_sets_login_error() {
        let backend = MockBackend::start().await;
        let engine = engine_for(&backend, Arc::new(MemoryStore::new()), None);
        engine.connect("wrong").await.unwrap();

        let state = wait_for_state(&engine, |s| s.login_error().is_some()).await;
        assert_eq!(state.login_error(), Some(LOGIN_ERROR));
        assert!(!state.connected());
    }

    #[tokio::test]
    async fn operations_require_connection() {
        let backend = MockBackend::start().await;
        let engine = engine_for(&backend, Arc::new(MemoryStore::new()), None);
        let err = engine
            .create_session(NewSession {
                workdir: "/w".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
        assert!(matches!(
            engine.delete_session("s1").await.unwrap_err(),
            ClientError::NotConnected
        ));
        // No active session and no connection: silently ignored
        engine.send_message("hi").await.unwrap();
    }

    #[tokio::test]
    async fn create_shows_placeholder_then_fast_path_replaces_it() {
        let backend = MockBackend::start().await;
        backend.set_push_on_create(true);
        let engine = connected_engine(&backend).await;

        let temp_id = engine
            .create_session(NewSession {
                workdir: "/home/u/app".into(),
                prompt: Some("hello".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(temp_id.starts_with(PENDING_ID_PREFIX));

        // Visible before any backend response is applied
        let state = engine.state();
        assert_eq!(state.active_session_id(), Some(temp_id.as_str()));
        let placeholder = state.active_session().unwrap();
        assert_eq!(placeholder.pending_for.as_deref(), Some("/home/u/app"));
        assert_eq!(placeholder.name.as_deref(), Some("hello"));

        let state = wait_for_state(&engine, |s| {
            s.active_session().is_some_and(|a| !a.is_placeholder())
        })
        .await;
        assert_eq!(state.sessions().len(), 1);
        let real_id = state.active_session_id().unwrap().to_string();

        // The delayed refresh must not resurrect or duplicate anything
        tokio::time::sleep(Duration::from_millis(200)).await;
        let state = engine.state();
        assert_eq!(state.sessions().len(), 1);
        assert_eq!(state.active_session_id(), Some(real_id.as_str()));

        let created = backend.created_requests();
        assert_eq!(created[0]["name"], "hello");
        assert_eq!(created[0]["prompt"], "hello");
        assert!(created[0].get("config").is_none());
    }

    #[tokio::test]
    async fn create_falls_back_to_delayed_refresh() {
        let backend = MockBackend::start().await;
        backend.add_session(MockBackend::session("older", "/w"));
        let engine = connected_engine(&backend).await;
        wait_for_state(&engine, |s| !s.sessions().is_empty()).await;

        engine
            .create_session(NewSession {
                workdir: "/w".into(),
                permission_mode: Some(PermissionMode::Plan),
                ..Default::default()
            })
            .await
            .unwrap();

        let state = wait_for_state(&engine, |s| {
            s.active_session().is_some_and(|a| !a.is_placeholder())
        })
        .await;
        assert_eq!(state.sessions().len(), 2);
        assert_ne!(state.active_session_id(), Some("older"));
        assert!(state.sessions().iter().all(|s| !s.is_placeholder()));
        assert_eq!(backend.created_requests()[0]["config"]["permissionMode"], "plan");
    }

    #[tokio::test]
    async fn failed_create_rolls_back_placeholder() {
        let backend = MockBackend::start().await;
        backend.set_fail_create(true);
        let engine = connected_engine(&backend).await;

        let temp_id = engine
            .create_session(NewSession {
                workdir: "/w".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let state = wait_for_state(&engine, |s| s.session(&temp_id).is_none()).await;
        assert!(state.sessions().is_empty());
        assert_eq!(state.active_session_id(), None);
    }

    #[tokio::test]
    async fn send_message_reconciles_echo() {
        let backend = MockBackend::start().await;
        backend.add_session(MockBackend::session("s1", "/w"));
        backend.set_echo_sends(true);
        let engine = connected_engine(&backend).await;
        wait_for_state(&engine, |s| s.session("s1").is_some()).await;
        engine.select_session("s1").await.unwrap();
        wait_for_state(&engine, |s| s.has_history("s1")).await;

        engine.send_message("   ").await.unwrap();
        assert!(engine.state().active_messages().is_empty());

        engine.send_message("run tests").await.unwrap();
        let state = wait_for_state(&engine, |s| s.active_messages().len() == 2).await;
        let messages = state.active_messages();
        assert_eq!(messages[0].role, MessageRole::User);
        assert!(!messages[0].optimistic);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert!(!state.awaiting_response());
        assert_eq!(backend.sent_messages(), vec![("s1".to_string(), "run tests".to_string())]);
    }

    #[tokio::test]
    async fn attention_follows_push_events_only() {
        let backend = MockBackend::start().await;
        backend.add_session(MockBackend::session("s1", "/w"));
        let engine = connected_engine(&backend).await;
        wait_for_state(&engine, |s| s.session("s1").is_some()).await;

        backend.push(&ServerEvent::AttentionRequested {
            attention: MockBackend::attention("a1", "s1"),
        });
        let state = wait_for_state(&engine, |s| s.attention().len() == 1).await;
        assert_eq!(state.attention()[0].kind, AttentionKind::Permission);

        engine
            .resolve_attention("a1", Resolution::Deny, Some("not now"))
            .await
            .unwrap();
        assert_eq!(engine.state().attention().len(), 1);
        assert_eq!(
            backend.resolutions()[0].1,
            serde_json::json!({ "behavior": "deny", "message": "not now" })
        );

        backend.push(&ServerEvent::AttentionResolved {
            attention_id: "a1".into(),
        });
        wait_for_state(&engine, |s| s.attention().is_empty()).await;
    }

    #[tokio::test]
    async fn refresh_failure_keeps_state() {
        let backend = MockBackend::start().await;
        backend.add_session(MockBackend::session("s1", "/w"));
        let engine = connected_engine(&backend).await;
        wait_for_state(&engine, |s| s.session("s1").is_some()).await;

        backend.set_fail_lists(true);
        engine.refresh().await.unwrap();
        let state = engine.state();
        assert_eq!(state.sessions().len(), 1);
        assert!(!state.is_refreshing());

        backend.set_fail_lists(false);
        backend.add_session(MockBackend::session("s2", "/w"));
        engine.refresh().await.unwrap();
        assert_eq!(engine.state().sessions().len(), 2);
    }

    #[tokio::test]
    async fn delete_rename_and_mode_update_local_state() {
        let backend = MockBackend::start().await;
        backend.add_session(MockBackend::session("s1", "/w"));
        backend.add_session(MockBackend::session("s2", "/w"));
        let store = Arc::new(MemoryStore::new());
        let engine = engine_for(&backend, store.clone(), None);
        engine.connect(TEST_TOKEN).await.unwrap();
        wait_for_state(&engine, |s| s.sessions().len() == 2).await;

        engine.rename_session("s2", "Auth refactor").await.unwrap();
        engine
            .update_permission_mode("s2", PermissionMode::DangerouslySkipPermissions)
            .await
            .unwrap();
        let state = engine.state();
        let s2 = state.session("s2").unwrap();
        assert_eq!(s2.name.as_deref(), Some("Auth refactor"));
        assert_eq!(s2.permission_mode, PermissionMode::DangerouslySkipPermissions);
        assert_eq!(
            backend.patches()[1].1,
            serde_json::json!({ "permissionMode": "dangerously-skip-permissions" })
        );

        engine.select_session("s1").await.unwrap();
        engine.delete_session("s1").await.unwrap();
        let state = engine.state();
        assert!(state.session("s1").is_none());
        assert_eq!(state.active_session_id(), None);
        let persisted: Option<String> = load_json(store.as_ref(), keys::ACTIVE_SESSION, None);
        assert!(persisted.is_none());

        let err = engine.delete_session("missing").await.unwrap_err();
        assert!(matches!(err, ClientError::RequestFailed { .. }));
    }

    #[tokio::test]
    async fn navigate_follows_address() {
        let backend = MockBackend::start().await;
        backend.add_session(MockBackend::session("s1", "/w"));
        backend.add_history("s1", vec![Message::optimistic_user("x")]);
        let engine = connected_engine(&backend).await;
        wait_for_state(&engine, |s| s.session("s1").is_some()).await;

        engine.navigate("#session=s1").await.unwrap();
        let state = wait_for_state(&engine, |s| s.has_history("s1")).await;
        assert_eq!(state.active_session_id(), Some("s1"));

        engine.navigate("").await.unwrap();
        assert_eq!(engine.state().active_session_id(), None);
        assert_eq!(engine.state().address(), "");
    }

    #[tokio::test]
    async fn session_ended_push_removes_session() {
        let backend = MockBackend::start().await;
        backend.add_session(MockBackend::session("s1", "/w"));
        backend.add_attention(MockBackend::attention("a1", "s1"));
        let engine = connected_engine(&backend).await;
        wait_for_state(&engine, |s| s.session("s1").is_some()).await;

        backend.push(&ServerEvent::SessionEnded {
            session_id: "s1".into(),
            reason: None,
        });
        let state = wait_for_state(&engine, |s| s.sessions().is_empty()).await;
        assert!(state.attention().is_empty());
    }

    #[tokio::test]
    async fn disconnect_tears_down_context() {
        let backend = MockBackend::start().await;
        let engine = connected_engine(&backend).await;
        engine.disconnect().await.unwrap();
        let state = engine.state();
        assert!(!state.connected());
        assert!(matches!(
            engine.browse(None).await.unwrap_err(),
            ClientError::NotConnected
        ));

        // Reconnect works after a disconnect
        engine.connect(TEST_TOKEN).await.unwrap();
        wait_for_state(&engine, |s| s.connected()).await;
        let listing = engine.browse(None).await.unwrap();
        assert!(listing.is_root);
    }
}
