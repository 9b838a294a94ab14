//! Routes decoded events to the caller's handlers.
//!
//! There is one optional slot per event kind. Handlers run synchronously on
//! the receive path, so they fire in frame arrival order and never overlap.
//! A handler that returns an error or panics is reported to the error slot
//! and the receive loop carries on.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};

use crate::error::Vox8Error;
use crate::protocol::{AudioEvent, InboundEvent, TranscriptEvent};

/// A caller-supplied event handler.
pub type Handler<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a closure as a [`Handler`].
pub fn handler<T, F>(f: F) -> Handler<T>
where
    F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Handler slots. Empty slots are no-ops.
#[derive(Clone, Default)]
pub struct Handlers {
    pub transcript: Option<Handler<TranscriptEvent>>,
    pub audio: Option<Handler<AudioEvent>>,
    pub error: Option<Handler<Vox8Error>>,
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("transcript", &self.transcript.is_some())
            .field("audio", &self.audio.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}

/// What happened to an event handed to [`Dispatcher::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The matching handler ran and succeeded.
    Delivered,
    /// The matching slot is empty.
    NoHandler,
    /// The handler failed; the failure went to the error slot.
    HandlerFailed,
    /// Not a caller-facing event (unrecognized, or session control).
    Dropped,
}

pub struct Dispatcher {
    handlers: Handlers,
    last_audio_sequence: Mutex<Option<u64>>,
    // Reports can come from the keepalive task as well as the receive path.
    error_gate: ReentrantMutex<()>,
}

impl Dispatcher {
    pub fn new(handlers: Handlers) -> Self {
        Self {
            handlers,
            last_audio_sequence: Mutex::new(None),
            error_gate: ReentrantMutex::new(()),
        }
    }

    pub fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    /// Deliver one inbound event to its slot.
    pub fn dispatch(&self, event: &InboundEvent) -> Outcome {
        match event {
            InboundEvent::Transcript(transcript) => {
                self.invoke("transcript", self.handlers.transcript.as_ref(), transcript)
            }
            InboundEvent::Audio(audio) => {
                self.check_sequence(audio.sequence);
                self.invoke("audio", self.handlers.audio.as_ref(), audio)
            }
            InboundEvent::Error(error) => {
                tracing::warn!(code = %error.code, message = %error.message, "Server error event");
                self.report(&Vox8Error::from(error.clone()))
            }
            InboundEvent::SessionStarted { session_id } => {
                tracing::debug!(session_id = %session_id, "Session acknowledgement is not dispatched");
                Outcome::Dropped
            }
            InboundEvent::Unrecognized { kind, .. } => {
                tracing::debug!(kind = %kind, "Dropping unrecognized event");
                Outcome::Dropped
            }
        }
    }

    /// Hand an error to the error slot. Failures of the error handler itself
    /// are only logged.
    pub fn report(&self, error: &Vox8Error) -> Outcome {
        let Some(handler) = self.handlers.error.as_ref() else {
            tracing::debug!(error = %error, "No error handler registered");
            return Outcome::NoHandler;
        };

        let _gate = self.error_gate.lock();
        match run_handler(handler, error) {
            Ok(()) => Outcome::Delivered,
            Err(message) => {
                tracing::error!(error = %error, handler_error = %message, "Error handler failed");
                Outcome::HandlerFailed
            }
        }
    }

    /// Reset per-session bookkeeping.
    pub fn reset(&self) {
        *self.last_audio_sequence.lock() = None;
    }

    fn invoke<T>(&self, name: &'static str, handler: Option<&Handler<T>>, event: &T) -> Outcome {
        let Some(handler) = handler else {
            return Outcome::NoHandler;
        };
        match run_handler(handler, event) {
            Ok(()) => Outcome::Delivered,
            Err(message) => {
                tracing::warn!(handler = name, error = %message, "Event handler failed");
                self.report(&Vox8Error::Callback {
                    handler: name,
                    message,
                });
                Outcome::HandlerFailed
            }
        }
    }

    fn check_sequence(&self, sequence: u64) {
        let mut last = self.last_audio_sequence.lock();
        if let Some(previous) = *last {
            if sequence <= previous {
                tracing::warn!(
                    previous,
                    sequence,
                    "Audio sequence did not increase; delivering in arrival order"
                );
            }
        }
        *last = Some(sequence);
    }
}

fn run_handler<T: ?Sized>(
    handler: &Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>,
    event: &T,
) -> Result<(), String> {
    match catch_unwind(AssertUnwindSafe(|| handler(event))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(panic) => Err(panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
