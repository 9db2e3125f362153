//! Client side of Clarvis: a backend client, the push event channel, and the
//! session synchronization engine that merges both into one session view.

pub mod api;
pub mod channel;
pub mod content;
pub mod creation;
pub mod engine;
pub mod error;
pub mod events;
pub mod prefs;
pub mod state;
pub mod storage;
pub mod types;

#[cfg(test)]
mod test_support;

pub use api::BackendClient;
pub use channel::EventChannel;
pub use engine::{EngineConfig, EngineHandle, NewSession};
pub use error::{ChannelError, ClientError};
pub use events::{ChannelEvent, ServerEvent};
pub use state::{SessionState, TranscriptItem};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use types::*;
