//! WebSocket transport over `tokio-tungstenite`.
//!
//! The stream is split after the handshake: the write half becomes the
//! [`FrameSink`], the read half is pumped by a background task into the
//! event queue. Some gateways deliver JSON inside Binary frames, so a binary
//! payload that starts with `{` and is valid UTF-8 is surfaced as a text
//! frame; any other binary frame is skipped.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{ChannelEvent, Connector, FrameSink, EVENT_CHANNEL_CAPACITY};
use crate::error::{Result, Vox8Error};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production [`Connector`] speaking WebSocket (`ws://` / `wss://`).
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(
        &self,
        endpoint: &str,
    ) -> Result<(Box<dyn FrameSink>, mpsc::Receiver<ChannelEvent>)> {
        tracing::debug!(endpoint = %endpoint, "Opening WebSocket");

        let (ws_stream, _response) = tokio_tungstenite::connect_async(endpoint)
            .await
            .map_err(|e| Vox8Error::Connection(format!("failed to connect to {endpoint}: {e}")))?;

        let (ws_sender, ws_receiver) = ws_stream.split();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        // The receiver is fresh, so this cannot fail.
        let _ = event_tx.send(ChannelEvent::Opened).await;

        tokio::spawn(inbound_loop(ws_receiver, event_tx));

        let sink: Box<dyn FrameSink> = Box::new(WebSocketSink {
            sender: ws_sender,
            closed: false,
        });
        Ok((sink, event_rx))
    }
}

struct WebSocketSink {
    sender: SplitSink<WsStream, WsMessage>,
    closed: bool,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: String) -> Result<()> {
        if self.closed {
            return Err(Vox8Error::Send("channel is closed".into()));
        }
        self.sender
            .send(WsMessage::Text(frame.into()))
            .await
            .map_err(|e| Vox8Error::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // The peer may already be gone; a failed close handshake is not an error.
        if let Err(e) = self.sender.close().await {
            tracing::debug!(error = %e, "WebSocket close handshake failed");
        }
        Ok(())
    }
}

/// Pump the read half into the event queue until the socket ends.
async fn inbound_loop(mut ws_receiver: SplitStream<WsStream>, event_tx: mpsc::Sender<ChannelEvent>) {
    let mut closed_sent = false;

    while let Some(msg_result) = ws_receiver.next().await {
        let event = match msg_result {
            Ok(msg) => match translate(msg) {
                Some(event) => event,
                None => continue,
            },
            Err(e) => {
                tracing::error!(error = %e, "WebSocket error");
                ChannelEvent::Error(e.to_string())
            }
        };

        let terminal = matches!(event, ChannelEvent::Closed { .. } | ChannelEvent::Error(_));
        closed_sent |= matches!(event, ChannelEvent::Closed { .. });
        if event_tx.send(event).await.is_err() {
            tracing::debug!("Event receiver dropped, closing inbound loop");
            return;
        }
        if terminal {
            break;
        }
    }

    if !closed_sent {
        let _ = event_tx
            .send(ChannelEvent::Closed {
                code: None,
                reason: "stream ended".into(),
            })
            .await;
    }
    tracing::debug!("WebSocket inbound loop terminated");
}

/// Map one WebSocket message to a channel event; `None` means skip it.
fn translate(msg: WsMessage) -> Option<ChannelEvent> {
    match msg {
        WsMessage::Text(text) => Some(ChannelEvent::Frame(text.as_str().to_owned())),
        WsMessage::Binary(data) => {
            if data.first() == Some(&b'{') {
                if let Ok(text) = std::str::from_utf8(&data) {
                    return Some(ChannelEvent::Frame(text.to_owned()));
                }
            }
            tracing::warn!(
                len = data.len(),
                first_byte = data.first().copied().unwrap_or(0),
                "Unexpected non-JSON binary frame, skipping"
            );
            None
        }
        WsMessage::Close(frame) => {
            tracing::info!(close_frame = ?frame, "WebSocket closed by peer");
            let (code, reason) = match frame {
                Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_owned()),
                None => (None, String::new()),
            };
            Some(ChannelEvent::Closed { code, reason })
        }
        // Ping/pong are answered by tungstenite.
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => None,
    }
}
