//! Session lifecycle state machine.
//!
//! ```text
//! Idle ─connect─▸ Connecting ─opened─▸ AwaitingSessionAck ─session_ready─▸ Active
//!                     │                       │                              │
//!                     └──────error/timeout────┴──────▸ Failed ◂──fatal───────┤
//!                                                                            │
//!                                      Closed ◂─transport closed─ Closing ◂──┘ disconnect
//! ```
//!
//! [`Session`] holds no I/O. The client serializes every transition through
//! it, so the rules here are the whole legality policy.

use std::fmt;

use crate::config::Credential;
use crate::error::{Result, Vox8Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Constructed, `connect()` not called yet.
    Idle,
    /// Transport is being opened.
    Connecting,
    /// `session_start` sent, waiting for `session_ready`.
    AwaitingSessionAck,
    /// Session acknowledged; audio may flow.
    Active,
    /// `session_end` sent, waiting for the transport to close.
    Closing,
    /// Gracefully closed. Terminal.
    Closed,
    /// Ended by an error or timeout. Terminal.
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::AwaitingSessionAck => "awaiting session ack",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        })
    }
}

/// Kind of credential a session authenticated with. The secret itself
/// stays in the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    ApiKey,
    SessionToken,
}

impl From<&Credential> for CredentialKind {
    fn from(credential: &Credential) -> Self {
        match credential {
            Credential::ApiKey(_) => Self::ApiKey,
            Credential::SessionToken(_) => Self::SessionToken,
        }
    }
}

/// What `disconnect()` has to do from the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Already closed or failed, or never connected.
    Nothing,
    /// Session was active: send `session_end` and wait for the close.
    EndSession,
    /// Handshake still in progress: just drop the transport.
    Abort,
    /// Another `disconnect()` is already in flight.
    AlreadyClosing,
}

#[derive(Debug)]
pub struct Session {
    state: SessionState,
    session_id: Option<String>,
    credential: CredentialKind,
}

impl Session {
    pub fn new(credential: CredentialKind) -> Self {
        Self {
            state: SessionState::Idle,
            session_id: None,
            credential,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn credential(&self) -> CredentialKind {
        self.credential
    }

    /// Idle → Connecting.
    pub fn begin_connect(&mut self) -> Result<()> {
        match self.state {
            SessionState::Idle => {
                self.state = SessionState::Connecting;
                Ok(())
            }
            state => Err(self.reject("connect", state)),
        }
    }

    /// Connecting → AwaitingSessionAck.
    pub fn channel_opened(&mut self) -> Result<()> {
        match self.state {
            SessionState::Connecting => {
                self.state = SessionState::AwaitingSessionAck;
                Ok(())
            }
            state => Err(self.reject("open", state)),
        }
    }

    /// AwaitingSessionAck → Active, capturing the session id.
    ///
    /// The id is assigned once; a later acknowledgement never replaces it.
    pub fn acknowledge(&mut self, session_id: String) -> Result<()> {
        match self.state {
            SessionState::AwaitingSessionAck if self.session_id.is_none() => {
                self.session_id = Some(session_id);
                self.state = SessionState::Active;
                Ok(())
            }
            state => Err(self.reject("acknowledge", state)),
        }
    }

    /// Decide how to tear down and, when needed, move to Closing.
    pub fn begin_close(&mut self) -> CloseAction {
        match self.state {
            SessionState::Idle | SessionState::Closed | SessionState::Failed => CloseAction::Nothing,
            SessionState::Active => {
                self.state = SessionState::Closing;
                CloseAction::EndSession
            }
            SessionState::Connecting | SessionState::AwaitingSessionAck => {
                self.state = SessionState::Closing;
                CloseAction::Abort
            }
            SessionState::Closing => CloseAction::AlreadyClosing,
        }
    }

    /// Transport reported Closed.
    ///
    /// Closing (and Active, when the server hangs up) end in Closed; a close
    /// in the middle of the handshake is a failure.
    pub fn transport_closed(&mut self) -> SessionState {
        self.state = match self.state {
            SessionState::Closing | SessionState::Active => SessionState::Closed,
            SessionState::Connecting | SessionState::AwaitingSessionAck => SessionState::Failed,
            terminal => terminal,
        };
        self.state
    }

    /// Any non-terminal state → Failed.
    pub fn fail(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Failed;
        }
    }

    /// Gate for `send_audio` / `send_keepalive`.
    pub fn ensure_active(&self, operation: &'static str) -> Result<()> {
        match self.state {
            SessionState::Active => Ok(()),
            state => Err(self.reject(operation, state)),
        }
    }

    fn reject(&self, operation: &'static str, state: SessionState) -> Vox8Error {
        if state.is_terminal() {
            Vox8Error::NotConnected(state)
        } else {
            Vox8Error::InvalidState { operation, state }
        }
    }
}
