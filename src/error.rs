//! Error taxonomy for the vox8 client.
//!
//! Construction-time problems surface as [`Vox8Error::Config`] straight from
//! the builder. Everything after `connect()` is either returned from the
//! operation that hit it or delivered to the registered error handler.

use std::time::Duration;

use crate::session::SessionState;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Vox8Error> = std::result::Result<T, E>;

/// Which bounded wait expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Opening the transport.
    Open,
    /// Waiting for `session_ready` after `session_start`.
    SessionAck,
    /// Waiting for the transport to close after `session_end`.
    Close,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Open => "transport open",
            Self::SessionAck => "session acknowledgement",
            Self::Close => "transport close",
        })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Vox8Error {
    /// Bad or missing configuration (credential, language, endpoint).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The transport could not be opened or dropped during the handshake.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A bounded wait expired.
    #[error("{kind} timed out after {after:?}")]
    Timeout { kind: TimeoutKind, after: Duration },

    /// The operation is not legal in the current session state.
    #[error("`{operation}` is not allowed while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// The session is closed or failed; nothing reaches the transport.
    #[error("not connected (session is {0})")]
    NotConnected(SessionState),

    /// `listen()` was called while another receive loop owns the channel.
    #[error("another receive loop is already running")]
    AlreadyListening,

    /// Writing a frame to the transport failed.
    #[error("failed to send frame: {0}")]
    Send(String),

    /// An outbound command could not be encoded.
    #[error("failed to encode command: {0}")]
    Encode(String),

    /// An inbound frame could not be decoded.
    #[error("failed to decode frame: {0}")]
    Decode(String),

    /// Error event sent by the service.
    #[error("server error [{code}]: {message}")]
    Server { code: String, message: String },

    /// A registered event handler failed or panicked.
    #[error("{handler} handler failed: {message}")]
    Callback {
        handler: &'static str,
        message: String,
    },
}

impl Vox8Error {
    /// True for errors that leave the session unusable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout { .. } | Self::NotConnected(_) | Self::Send(_)
        )
    }

    pub(crate) fn decode(err: impl std::fmt::Display) -> Self {
        Self::Decode(err.to_string())
    }
}
