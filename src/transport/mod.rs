//! Message channel abstraction.
//!
//! The client needs three things from a transport: open a connection,
//! write whole text frames, and observe lifecycle events. A [`Connector`]
//! opens the channel and hands back the write half ([`FrameSink`]) plus the
//! single receiver of [`ChannelEvent`]s.
//!
//! Every connection yields exactly one [`ChannelEvent::Opened`] first and at
//! most one [`ChannelEvent::Closed`] last.

pub mod memory;
pub mod websocket;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

pub use memory::{MemoryConnector, MemoryServer};
pub use websocket::WebSocketConnector;

/// Capacity of the inbound event queue between transport and client.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle signals surfaced by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    /// One complete text frame.
    Frame(String),
    /// Transport-level error; the connection is unusable afterwards.
    Error(String),
    Closed { code: Option<u16>, reason: String },
}

/// Write half of an open channel.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one complete text frame.
    async fn send(&mut self, frame: String) -> Result<()>;

    /// Start a graceful shutdown. Calling it again is a no-op.
    async fn close(&mut self) -> Result<()>;
}

/// Opens channels to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        endpoint: &str,
    ) -> Result<(Box<dyn FrameSink>, mpsc::Receiver<ChannelEvent>)>;
}
