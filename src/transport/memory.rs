//! In-process transport.
//!
//! [`MemoryConnector::pair`] returns a connector for the client and a
//! [`MemoryServer`] that plays the service: it sees every frame the client
//! writes and can push frames or close the channel. Used by the test suite
//! and handy for driving the client without a network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{ChannelEvent, Connector, FrameSink, EVENT_CHANNEL_CAPACITY};
use crate::error::{Result, Vox8Error};
use crate::protocol::{decode_command, OutboundCommand};

/// How the connector behaves when the client calls `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBehavior {
    Accept,
    Refuse,
    /// Never completes; exercises the open timeout.
    Stall,
}

struct Pending {
    event_tx: mpsc::Sender<ChannelEvent>,
    closed: Arc<AtomicBool>,
    event_rx: mpsc::Receiver<ChannelEvent>,
    sent_tx: mpsc::UnboundedSender<String>,
}

/// Client-side half of an in-memory channel. Single use.
#[derive(Clone)]
pub struct MemoryConnector {
    pending: Arc<Mutex<Option<Pending>>>,
    behavior: OpenBehavior,
    endpoint: Arc<Mutex<Option<String>>>,
}

/// Server-side half of an in-memory channel.
pub struct MemoryServer {
    event_tx: mpsc::Sender<ChannelEvent>,
    closed: Arc<AtomicBool>,
    sent_rx: mpsc::UnboundedReceiver<String>,
    endpoint: Arc<Mutex<Option<String>>>,
}

impl MemoryConnector {
    /// A connector whose `open` succeeds, and the server that backs it.
    pub fn pair() -> (Self, MemoryServer) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let endpoint = Arc::new(Mutex::new(None));
        let closed = Arc::new(AtomicBool::new(false));
        let connector = Self {
            pending: Arc::new(Mutex::new(Some(Pending {
                event_tx: event_tx.clone(),
                closed: Arc::clone(&closed),
                event_rx,
                sent_tx,
            }))),
            behavior: OpenBehavior::Accept,
            endpoint: Arc::clone(&endpoint),
        };
        let server = MemoryServer {
            event_tx,
            closed,
            sent_rx,
            endpoint,
        };
        (connector, server)
    }

    /// A connector that refuses every `open`.
    pub fn refusing() -> Self {
        Self {
            pending: Arc::new(Mutex::new(None)),
            behavior: OpenBehavior::Refuse,
            endpoint: Arc::new(Mutex::new(None)),
        }
    }

    /// A connector whose `open` never completes.
    pub fn stalled() -> Self {
        Self {
            pending: Arc::new(Mutex::new(None)),
            behavior: OpenBehavior::Stall,
            endpoint: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(
        &self,
        endpoint: &str,
    ) -> Result<(Box<dyn FrameSink>, mpsc::Receiver<ChannelEvent>)> {
        match self.behavior {
            OpenBehavior::Refuse => {
                return Err(Vox8Error::Connection(format!(
                    "connection to {endpoint} refused"
                )))
            }
            OpenBehavior::Stall => std::future::pending::<()>().await,
            OpenBehavior::Accept => {}
        }

        let pending = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| Vox8Error::Connection("memory channel already used".into()))?;

        pending
            .event_tx
            .send(ChannelEvent::Opened)
            .await
            .map_err(|_| Vox8Error::Connection("memory server dropped".into()))?;
        *self.endpoint.lock() = Some(endpoint.to_string());

        let sink: Box<dyn FrameSink> = Box::new(MemorySink {
            event_tx: pending.event_tx,
            channel_closed: pending.closed,
            sent_tx: pending.sent_tx,
            closed: false,
        });
        Ok((sink, pending.event_rx))
    }
}

struct MemorySink {
    event_tx: mpsc::Sender<ChannelEvent>,
    // Shared with the server so only one side emits Closed.
    channel_closed: Arc<AtomicBool>,
    sent_tx: mpsc::UnboundedSender<String>,
    closed: bool,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: String) -> Result<()> {
        if self.closed {
            return Err(Vox8Error::Send("channel is closed".into()));
        }
        self.sent_tx
            .send(frame)
            .map_err(|_| Vox8Error::Send("memory server dropped".into()))
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.channel_closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Mirror a WebSocket close handshake: the local side observes Closed.
        let _ = self
            .event_tx
            .send(ChannelEvent::Closed {
                code: Some(1000),
                reason: "client closed".into(),
            })
            .await;
        Ok(())
    }
}

impl MemoryServer {
    /// Next raw frame written by the client, or `None` once the client side
    /// is gone.
    pub async fn next_frame(&mut self) -> Option<String> {
        self.sent_rx.recv().await
    }

    /// Next frame written by the client, decoded as a command.
    pub async fn next_command(&mut self) -> Option<Result<OutboundCommand>> {
        self.next_frame().await.map(|frame| decode_command(&frame))
    }

    /// Like [`next_command`](Self::next_command) but gives up after `wait`.
    pub async fn next_command_within(&mut self, wait: Duration) -> Option<Result<OutboundCommand>> {
        tokio::time::timeout(wait, self.next_command())
            .await
            .ok()
            .flatten()
    }

    /// Frames the client has written that have not been read yet.
    pub fn drain_frames(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.sent_rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Push a raw text frame to the client.
    pub async fn send_frame(&self, frame: impl Into<String>) {
        let _ = self.event_tx.send(ChannelEvent::Frame(frame.into())).await;
    }

    /// Push a JSON event to the client.
    pub async fn send_json(&self, value: Value) {
        self.send_frame(value.to_string()).await;
    }

    /// Report a transport error to the client.
    pub async fn fail(&self, detail: impl Into<String>) {
        let _ = self.event_tx.send(ChannelEvent::Error(detail.into())).await;
    }

    /// Close the channel from the server side.
    pub async fn close(&self, code: u16, reason: impl Into<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self
            .event_tx
            .send(ChannelEvent::Closed {
                code: Some(code),
                reason: reason.into(),
            })
            .await;
    }

    /// Endpoint the client opened, once it has.
    pub fn endpoint(&self) -> Option<String> {
        self.endpoint.lock().clone()
    }
}
