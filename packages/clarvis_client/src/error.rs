use reqwest::StatusCode;

/// Transport-level failure on the event channel. Reported as a
/// [`ChannelEvent::Error`](crate::events::ChannelEvent::Error), never returned.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("failed to connect event channel: {0}")]
    Connect(String),

    #[error("event channel transport error: {0}")]
    Transport(String),
}

impl ChannelError {
    pub fn from_tungstenite(err: tokio_tungstenite::tungstenite::Error, connecting: bool) -> Self {
        if connecting {
            Self::Connect(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Non-success response from the backend.
    #[error("{message}")]
    RequestFailed { status: StatusCode, message: String },

    #[error("request transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("not connected")]
    NotConnected,

    #[error("session engine has stopped")]
    EngineStopped,
}

impl ClientError {
    /// Build a `RequestFailed` from a response body, falling back to the
    /// status reason phrase and then a fixed message.
    pub fn from_response_body(status: StatusCode, body: &[u8]) -> Self {
        let message = serde_json::from_slice::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("error")?.as_str().map(str::to_string))
            .filter(|m| !m.is_empty())
            .or_else(|| status.canonical_reason().map(str::to_string))
            .unwrap_or_else(|| "Request failed".to_string());
        Self::RequestFailed { status, message }
    }
}
