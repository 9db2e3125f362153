//! Authenticated request/response calls against the backend, reached
//! through the proxy's `/api` prefix.

use reqwest::{Method, RequestBuilder, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ChannelError, ClientError};
use crate::types::{
    AttentionItem, AttentionResolution, BrowseResponse, CreateSessionRequest,
    CreateSessionResponse, Session, SessionDetail, WorkdirConfig,
};

const API_PREFIX: &str = "/api";

/// Stateless client for the backend endpoints. Cheap to clone.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    origin: String,
    token: String,
}

impl BackendClient {
    /// `origin` is the proxy origin, e.g. `http://127.0.0.1:3000`.
    pub fn new(origin: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_http(reqwest::Client::new(), origin, token)
    }

    pub fn with_http(
        http: reqwest::Client,
        origin: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        let origin = origin.into().trim_end_matches('/').to_string();
        Self {
            http,
            origin,
            token: token.into(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Event channel address: the origin with a `ws`/`wss` scheme, path `/ws`
    /// and the credential in the query string.
    pub fn events_url(&self) -> Result<String, ChannelError> {
        let mut url = Url::parse(&self.origin).map_err(|e| ChannelError::Connect(e.to_string()))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ChannelError::Connect(format!("cannot use {} as ws origin", self.origin)))?;
        url.set_path("/ws");
        url.query_pairs_mut().clear().append_pair("token", &self.token);
        Ok(url.to_string())
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}{}", self.origin, API_PREFIX, path))
            .bearer_auth(&self.token)
    }

    async fn execute(&self, req: RequestBuilder) -> Result<impl AsRef<[u8]>, ClientError> {
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        if !status.is_success() {
            return Err(ClientError::from_response_body(status, &body));
        }
        Ok(body)
    }

    async fn json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ClientError> {
        let body = self.execute(req).await?;
        Ok(serde_json::from_slice(body.as_ref())?)
    }

    /// For endpoints whose response body carries nothing we use.
    async fn unit(&self, req: RequestBuilder) -> Result<(), ClientError> {
        self.execute(req).await.map(|_| ())
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, ClientError> {
        self.json(self.request(Method::GET, "/sessions")).await
    }

    pub async fn get_session(&self, id: &str) -> Result<SessionDetail, ClientError> {
        self.json(self.request(Method::GET, &format!("/sessions/{}", id)))
            .await
    }

    pub async fn create_session(
        &self,
        body: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse, ClientError> {
        self.json(self.request(Method::POST, "/sessions").json(body))
            .await
    }

    pub async fn delete_session(&self, id: &str) -> Result<(), ClientError> {
        self.unit(self.request(Method::DELETE, &format!("/sessions/{}", id)))
            .await
    }

    pub async fn send_message(&self, session_id: &str, message: &str) -> Result<(), ClientError> {
        #[derive(Serialize)]
        struct SendBody<'a> {
            message: &'a str,
        }
        self.unit(
            self.request(Method::POST, &format!("/sessions/{}/send", session_id))
                .json(&SendBody { message }),
        )
        .await
    }

    pub async fn interrupt_session(&self, session_id: &str) -> Result<(), ClientError> {
        self.unit(self.request(Method::POST, &format!("/sessions/{}/interrupt", session_id)))
            .await
    }

    pub async fn list_attention(&self) -> Result<Vec<AttentionItem>, ClientError> {
        self.json(self.request(Method::GET, "/attention")).await
    }

    pub async fn resolve_attention(
        &self,
        attention_id: &str,
        resolution: &AttentionResolution,
    ) -> Result<(), ClientError> {
        self.unit(
            self.request(Method::POST, &format!("/attention/{}/resolve", attention_id))
                .json(resolution),
        )
        .await
    }

    pub async fn rename_session(&self, id: &str, name: &str) -> Result<(), ClientError> {
        self.update_session(id, serde_json::json!({ "name": name }))
            .await
    }

    /// PATCH arbitrary session fields.
    pub async fn update_session(&self, id: &str, updates: Value) -> Result<(), ClientError> {
        self.unit(
            self.request(Method::PATCH, &format!("/sessions/{}", id))
                .json(&updates),
        )
        .await
    }

    pub async fn browse(&self, path: Option<&str>) -> Result<BrowseResponse, ClientError> {
        let mut req = self.request(Method::GET, "/browse");
        if let Some(path) = path.filter(|p| !p.is_empty()) {
            req = req.query(&[("path", path)]);
        }
        self.json(req).await
    }

    pub async fn workdir_config(&self, workdir: &str) -> Result<WorkdirConfig, ClientError> {
        self.json(
            self.request(Method::GET, "/workdir/config")
                .query(&[("path", workdir)]),
        )
        .await
    }
}
