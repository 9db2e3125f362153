use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ChannelError;
use crate::types::{AttentionItem, Message, ResolvedInteraction, Session};

/// Frames pushed by the backend over the event channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session:created", rename_all = "camelCase")]
    SessionCreated {
        session: Session,
        /// Correlates with the `tempId` returned by the create call.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
    },
    #[serde(rename = "session:updated")]
    SessionUpdated { session: Session },
    #[serde(rename = "session:ended", rename_all = "camelCase")]
    SessionEnded {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "session:message", rename_all = "camelCase")]
    SessionMessage { session_id: String, message: Message },
    #[serde(rename = "attention:requested")]
    AttentionRequested { attention: AttentionItem },
    #[serde(rename = "attention:resolved", rename_all = "camelCase")]
    AttentionResolved { attention_id: String },
    #[serde(rename = "interaction:resolved", rename_all = "camelCase")]
    InteractionResolved {
        session_id: String,
        interaction: ResolvedInteraction,
    },
    #[serde(other)]
    Unknown,
}

/// Frames this client sends on the event channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Subscribe,
}

impl ClientFrame {
    pub fn to_json(&self) -> String {
        match self {
            ClientFrame::Subscribe => r#"{"type":"subscribe"}"#.to_string(),
        }
    }
}

/// Everything the event channel reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    Error(ChannelError),
    Server(ServerEvent),
}

/// Parse one inbound text frame. Malformed frames are dropped.
pub fn parse_frame(text: &str) -> Option<ServerEvent> {
    match serde_json::from_str(text) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!("Dropping malformed event frame: {}", e);
            None
        }
    }
}
