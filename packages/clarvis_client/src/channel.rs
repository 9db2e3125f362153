//! The persistent push channel to the backend.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::{ChannelEvent, ClientFrame, parse_frame};

const CHANNEL_BUFFER: usize = 256;

/// Owner side of an open event channel. Dropping it closes the channel.
#[derive(Debug)]
pub struct EventChannel {
    cancel: CancellationToken,
}

impl EventChannel {
    /// Open the channel and return it with the stream of events it reports.
    ///
    /// The first events are `Connected` (after the subscribe frame went out),
    /// or `Error` followed by `Disconnected` if the connection failed.
    pub fn open(url: String) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        let cancel = CancellationToken::new();
        tokio::spawn(run_channel(url, tx, cancel.clone()));
        (Self { cancel }, rx)
    }

    /// Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_channel(url: String, tx: mpsc::Sender<ChannelEvent>, cancel: CancellationToken) {
    let connected = tokio::select! {
        _ = cancel.cancelled() => return,
        result = tokio_tungstenite::connect_async(url.as_str()) => result,
    };

    let ws = match connected {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!("Event channel connect failed: {}", e);
            let _ = tx
                .send(ChannelEvent::Error(ChannelError::from_tungstenite(e, true)))
                .await;
            let _ = tx.send(ChannelEvent::Disconnected).await;
            return;
        }
    };

    let (mut sink, mut stream) = ws.split();

    if let Err(e) = sink
        .send(Message::Text(ClientFrame::Subscribe.to_json().into()))
        .await
    {
        let _ = tx
            .send(ChannelEvent::Error(ChannelError::from_tungstenite(e, false)))
            .await;
        let _ = tx.send(ChannelEvent::Disconnected).await;
        return;
    }

    if tx.send(ChannelEvent::Connected).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = parse_frame(text.as_str()) {
                        if tx.send(ChannelEvent::Server(event)).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Event channel closed by backend");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Event channel error: {}", e);
                    let _ = tx
                        .send(ChannelEvent::Error(ChannelError::from_tungstenite(e, false)))
                        .await;
                    break;
                }
            }
        }
    }

    let _ = tx.send(ChannelEvent::Disconnected).await;
}
