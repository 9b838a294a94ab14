//! The vox8 streaming translation client.
//!
//! [`Vox8Client`] owns one session over one transport. `connect()` runs the
//! handshake and returns once the service has acknowledged the session;
//! `listen()` drives the receive loop and feeds the registered handlers;
//! `send_audio()` / `send_pcm()` stream audio while the session is active;
//! `disconnect()` ends it.
//!
//! The client is cheap to clone. A typical caller spawns `listen()` on a
//! clone and keeps streaming audio from the original.

use std::ops::ControlFlow;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::dispatch::{handler, Dispatcher, Handlers};
use crate::error::{Result, TimeoutKind, Vox8Error};
use crate::keepalive::Keepalive;
use crate::protocol::{self, AudioEvent, InboundEvent, OutboundCommand, TranscriptEvent};
use crate::session::{CloseAction, CredentialKind, Session, SessionState};
use crate::transport::{ChannelEvent, Connector, FrameSink, WebSocketConnector};

type Events = mpsc::Receiver<ChannelEvent>;

/// Builder for [`Vox8Client`]: connector and handler registration.
pub struct ClientBuilder {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    handlers: Handlers,
}

impl ClientBuilder {
    /// Use a different transport. Defaults to WebSocket.
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// Called for every transcript, partial or final.
    pub fn on_transcript<F>(mut self, f: F) -> Self
    where
        F: Fn(&TranscriptEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.transcript = Some(handler(f));
        self
    }

    /// Called for every chunk of synthesized audio, in arrival order.
    pub fn on_audio<F>(mut self, f: F) -> Self
    where
        F: Fn(&AudioEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.audio = Some(handler(f));
        self
    }

    /// Called for server errors, dropped frames and failing handlers.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Vox8Error) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.error = Some(handler(f));
        self
    }

    pub fn build(self) -> Vox8Client {
        let session = Session::new(CredentialKind::from(self.config.credential()));
        let (closed_tx, _) = watch::channel(false);
        Vox8Client {
            inner: Arc::new(Inner {
                config: self.config,
                connector: self.connector,
                session: Mutex::new(session),
                dispatcher: Dispatcher::new(self.handlers),
                sink: AsyncMutex::new(None),
                events: AsyncMutex::new(None),
                closed_tx,
                keepalive: Mutex::new(None),
                listen_cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }
}

#[derive(Clone)]
pub struct Vox8Client {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    session: Mutex<Session>,
    dispatcher: Dispatcher,
    /// Write half; the lock serializes frame writes.
    sink: AsyncMutex<Option<Box<dyn FrameSink>>>,
    /// Held by whichever loop is currently reading the channel.
    events: AsyncMutex<Option<Events>>,
    /// Flips to true once the transport is gone.
    closed_tx: watch::Sender<bool>,
    keepalive: Mutex<Option<Keepalive>>,
    listen_cancel: Mutex<CancellationToken>,
}

impl std::fmt::Debug for Vox8Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vox8Client")
            .field("endpoint", &self.inner.config.endpoint())
            .field("state", &self.state())
            .field("session_id", &self.session_id())
            .field("handlers", self.inner.dispatcher.handlers())
            .finish()
    }
}

impl Vox8Client {
    /// Client over WebSocket with no handlers registered.
    pub fn new(config: ClientConfig) -> Self {
        Self::builder(config).build()
    }

    /// Client over a custom transport with no handlers registered.
    pub fn with_connector(config: ClientConfig, connector: impl Connector + 'static) -> Self {
        Self::builder(config).connector(connector).build()
    }

    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            connector: Arc::new(WebSocketConnector::new()),
            handlers: Handlers::default(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// True only while the session is Active.
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Id assigned by the service. Kept after the session ends.
    pub fn session_id(&self) -> Option<String> {
        self.inner.session.lock().session_id().map(str::to_owned)
    }

    /// Open the transport, send `session_start` and wait for
    /// `session_ready`.
    ///
    /// On success the session is Active. Every failure leaves it Failed and
    /// the transport closed.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        inner.session.lock().begin_connect()?;
        inner.dispatcher.reset();

        let timeouts = inner.config.timeouts();
        let endpoint = inner.config.endpoint();
        tracing::info!(
            endpoint = %endpoint,
            target_language = %inner.config.target_language(),
            source_language = %inner.config.source_language(),
            voice_mode = %inner.config.voice_mode(),
            "Connecting to vox8"
        );

        let open_deadline = Instant::now() + timeouts.open;
        let (sink, mut events) =
            match tokio::time::timeout_at(open_deadline, inner.connector.open(endpoint)).await {
                Ok(Ok(channel)) => channel,
                Ok(Err(e)) => return Err(inner.abort_handshake(e).await),
                Err(_) => {
                    return Err(inner
                        .abort_handshake(Vox8Error::Timeout {
                            kind: TimeoutKind::Open,
                            after: timeouts.open,
                        })
                        .await)
                }
            };
        *inner.sink.lock().await = Some(sink);

        let opened = match tokio::time::timeout_at(open_deadline, wait_opened(&mut events)).await {
            Ok(result) => result,
            Err(_) => Err(Vox8Error::Timeout {
                kind: TimeoutKind::Open,
                after: timeouts.open,
            }),
        };
        if let Err(e) = opened {
            return Err(inner.abort_handshake(e).await);
        }

        let transitioned = inner.session.lock().channel_opened();
        if let Err(e) = transitioned {
            return Err(inner.abort_handshake(e).await);
        }
        tracing::debug!("Channel open, sending session_start");

        let start = OutboundCommand::start_session(&inner.config);
        let sent = match protocol::encode(&start) {
            Ok(frame) => {
                let mut sink = inner.sink.lock().await;
                inner.write_frame(&mut sink, frame).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            return Err(inner.abort_handshake(e).await);
        }

        let acked =
            match tokio::time::timeout(timeouts.session_ack, inner.await_ack(&mut events)).await {
                Ok(result) => result,
                Err(_) => Err(Vox8Error::Timeout {
                    kind: TimeoutKind::SessionAck,
                    after: timeouts.session_ack,
                }),
            };
        let session_id = match acked {
            Ok(id) => id,
            Err(e) => return Err(inner.abort_handshake(e).await),
        };

        *inner.events.lock().await = Some(events);
        let acknowledged = inner.session.lock().acknowledge(session_id.clone());
        if let Err(e) = acknowledged {
            return Err(inner.abort_handshake(e).await);
        }

        inner.start_keepalive();
        tracing::info!(session_id = %session_id, "vox8 session active");
        Ok(())
    }

    /// Run the receive loop until the transport closes or
    /// [`cancel_listen`](Self::cancel_listen) is called.
    ///
    /// Malformed frames and failing handlers are reported to the error
    /// handler and the loop keeps going. Returns `Ok` when the channel
    /// closes, and the transport error when it breaks.
    pub async fn listen(&self) -> Result<()> {
        let inner = &self.inner;
        let state = inner.state();
        match state {
            SessionState::Active | SessionState::Closing => {}
            state if state.is_terminal() => return Err(Vox8Error::NotConnected(state)),
            state => {
                return Err(Vox8Error::InvalidState {
                    operation: "listen",
                    state,
                })
            }
        }

        let Ok(mut slot) = inner.events.try_lock() else {
            return Err(Vox8Error::AlreadyListening);
        };
        let Some(events) = slot.as_mut() else {
            return Err(Vox8Error::NotConnected(inner.state()));
        };

        let cancel = inner.listen_token();
        tracing::debug!("Receive loop started");

        let outcome = loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("Receive loop cancelled");
                    break Ok(());
                }
                event = events.recv() => event.unwrap_or_else(channel_dropped),
            };
            if let ControlFlow::Break(result) = inner.handle_event(event).await {
                break result;
            }
        };

        let transport_gone = *inner.closed_tx.borrow();
        if transport_gone {
            *slot = None;
        }
        outcome
    }

    /// Stop a running [`listen`](Self::listen). The session stays as it is.
    pub fn cancel_listen(&self) {
        self.inner.listen_cancel.lock().cancel();
    }

    /// Send one base64-encoded audio chunk.
    pub async fn send_audio(&self, payload: impl Into<String>) -> Result<()> {
        let command = OutboundCommand::AudioChunk {
            payload: payload.into(),
        };
        self.inner.send_command("send_audio", command).await
    }

    /// Base64-encode raw PCM and send it as one chunk.
    pub async fn send_pcm(&self, pcm: &[u8]) -> Result<()> {
        self.inner
            .send_command("send_audio", protocol::audio_chunk_from_pcm(pcm))
            .await
    }

    pub async fn send_keepalive(&self) -> Result<()> {
        self.inner
            .send_command("send_keepalive", OutboundCommand::Keepalive)
            .await
    }

    /// End the session.
    ///
    /// From Active this sends `session_end` and waits up to the close
    /// timeout for the transport to close. During the handshake it just
    /// drops the transport. Once closed or failed it is a no-op.
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        let action = inner.session.lock().begin_close();
        match action {
            CloseAction::Nothing => {
                tracing::debug!(state = %inner.state(), "Nothing to disconnect");
                Ok(())
            }
            CloseAction::AlreadyClosing => {
                // An earlier disconnect may have been dropped mid-wait; finish its teardown.
                tracing::debug!("Disconnect already in progress, waiting for the close");
                inner.finish_close().await
            }
            CloseAction::Abort => {
                tracing::info!("Aborting vox8 handshake");
                inner.transport_gone().await;
                inner.session.lock().transport_closed();
                Ok(())
            }
            CloseAction::EndSession => inner.end_session().await,
        }
    }
}

impl Inner {
    fn state(&self) -> SessionState {
        self.session.lock().state()
    }

    async fn await_ack(&self, events: &mut Events) -> Result<String> {
        loop {
            let Some(event) = events.recv().await else {
                return Err(Vox8Error::Connection(
                    "channel dropped before session_ready".into(),
                ));
            };
            match event {
                ChannelEvent::Frame(text) => {
                    let event = match protocol::decode(&text) {
                        Ok(event) => event,
                        Err(e) => match protocol::frame_kind(&text) {
                            // Only an unreadable or broken acknowledgement ends the handshake.
                            Some(kind) if !protocol::is_session_ack(&kind) => {
                                tracing::warn!(
                                    kind = %kind,
                                    error = %e,
                                    "Dropping malformed frame before session_ready"
                                );
                                self.dispatcher.report(&e);
                                continue;
                            }
                            _ => return Err(e),
                        },
                    };
                    match &event {
                        InboundEvent::SessionStarted { session_id } => {
                            return Ok(session_id.clone());
                        }
                        InboundEvent::Error(error) => {
                            self.dispatcher.dispatch(&event);
                            return Err(Vox8Error::from(error.clone()));
                        }
                        _ => {
                            self.dispatcher.dispatch(&event);
                        }
                    }
                }
                ChannelEvent::Opened => {}
                ChannelEvent::Error(detail) => return Err(Vox8Error::Connection(detail)),
                ChannelEvent::Closed { code, reason } => {
                    return Err(Vox8Error::Connection(format!(
                        "closed before session_ready (code {code:?}): {reason}"
                    )))
                }
            }
        }
    }

    /// Fail the session and tear the transport down.
    async fn abort_handshake(&self, error: Vox8Error) -> Vox8Error {
        tracing::error!(error = %error, "vox8 handshake failed");
        self.session.lock().fail();
        self.transport_gone().await;
        error
    }

    async fn end_session(&self) -> Result<()> {
        self.stop_keepalive();

        let frame = protocol::encode(&OutboundCommand::EndSession)?;
        {
            let mut sink = self.sink.lock().await;
            self.write_frame(&mut sink, frame).await?;
        }
        tracing::debug!("session_end sent, waiting for the channel to close");
        self.finish_close().await
    }

    /// Wait (bounded by the close timeout) for the transport to close, then
    /// settle the session in Closed or Failed.
    async fn finish_close(&self) -> Result<()> {
        let close_timeout = self.config.timeouts().close;
        let waited = tokio::time::timeout(close_timeout, self.wait_closed()).await;
        self.transport_gone().await;

        match waited {
            Ok(()) => {
                let state = self.session.lock().transport_closed();
                tracing::info!(state = %state, "vox8 session ended");
                if state == SessionState::Closed {
                    Ok(())
                } else {
                    Err(Vox8Error::NotConnected(state))
                }
            }
            Err(_) => {
                tracing::warn!(after = ?close_timeout, "Channel did not close in time");
                self.session.lock().fail();
                Err(Vox8Error::Timeout {
                    kind: TimeoutKind::Close,
                    after: close_timeout,
                })
            }
        }
    }

    /// Wait for the transport to close, reading the channel ourselves when
    /// no receive loop owns it.
    async fn wait_closed(&self) {
        let closed = closed_signal(self.closed_tx.subscribe());
        tokio::select! {
            _ = closed => {}
            mut slot = self.events.lock() => {
                let already_closed = *self.closed_tx.borrow();
                if already_closed {
                    return;
                }
                match slot.as_mut() {
                    Some(events) => loop {
                        let event = events.recv().await.unwrap_or_else(channel_dropped);
                        if self.handle_event(event).await.is_break() {
                            break;
                        }
                    },
                    None => closed_signal(self.closed_tx.subscribe()).await,
                }
                *slot = None;
            }
        }
    }

    async fn handle_event(&self, event: ChannelEvent) -> ControlFlow<Result<()>> {
        match event {
            ChannelEvent::Opened => ControlFlow::Continue(()),
            ChannelEvent::Frame(text) => {
                self.handle_frame(&text).await;
                ControlFlow::Continue(())
            }
            ChannelEvent::Error(detail) => {
                tracing::error!(error = %detail, "vox8 transport error");
                let error = Vox8Error::Connection(detail);
                self.session.lock().fail();
                self.transport_gone().await;
                self.dispatcher.report(&error);
                ControlFlow::Break(Err(error))
            }
            ChannelEvent::Closed { code, reason } => {
                let state = self.session.lock().transport_closed();
                self.transport_gone().await;
                tracing::info!(code = ?code, reason = %reason, state = %state, "vox8 channel closed");
                ControlFlow::Break(Ok(()))
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        let event = match protocol::decode(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed frame");
                self.dispatcher.report(&e);
                return;
            }
        };

        match &event {
            InboundEvent::SessionStarted { session_id } => {
                tracing::debug!(session_id = %session_id, "Ignoring repeated session_ready");
            }
            InboundEvent::Error(error) => {
                self.dispatcher.dispatch(&event);
                if self.config.is_fatal_error(&error.code) {
                    tracing::error!(code = %error.code, "Fatal server error, ending session");
                    self.session.lock().begin_close();
                    self.stop_keepalive();
                    self.close_sink().await;
                    self.session.lock().fail();
                }
            }
            _ => {
                self.dispatcher.dispatch(&event);
            }
        }
    }

    async fn send_command(&self, operation: &'static str, command: OutboundCommand) -> Result<()> {
        self.session.lock().ensure_active(operation)?;
        let frame = protocol::encode(&command)?;

        let mut sink = self.sink.lock().await;
        // A disconnect may have sent session_end while we waited for the sink.
        self.session.lock().ensure_active(operation)?;
        self.write_frame(&mut sink, frame).await
    }

    /// Write one frame. A failed write fails the session.
    async fn write_frame(&self, sink: &mut Option<Box<dyn FrameSink>>, frame: String) -> Result<()> {
        let Some(channel) = sink.as_mut() else {
            return Err(Vox8Error::Send("channel is closed".into()));
        };
        if let Err(e) = channel.send(frame).await {
            tracing::error!(error = %e, "vox8 send failed, failing session");
            self.session.lock().fail();
            self.stop_keepalive();
            if let Some(mut channel) = sink.take() {
                let _ = channel.close().await;
            }
            return Err(e);
        }
        Ok(())
    }

    async fn close_sink(&self) {
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                tracing::debug!(error = %e, "Closing channel failed");
            }
        }
    }

    /// The transport is finished: stop keepalive, close the write half and
    /// wake anyone waiting for the close.
    async fn transport_gone(&self) {
        self.stop_keepalive();
        self.close_sink().await;
        self.closed_tx.send_replace(true);
    }

    fn start_keepalive(self: &Arc<Self>) {
        let Some(period) = self.config.keepalive_interval() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let keepalive = Keepalive::spawn(period, move || {
            let weak = weak.clone();
            async move {
                let inner = weak
                    .upgrade()
                    .ok_or(Vox8Error::NotConnected(SessionState::Closed))?;
                let result = inner
                    .send_command("send_keepalive", OutboundCommand::Keepalive)
                    .await;
                if let Err(e @ Vox8Error::Send(_)) = &result {
                    inner.dispatcher.report(e);
                }
                result
            }
        });
        tracing::debug!(period = ?period, "Keepalive started");
        if let Some(previous) = self.keepalive.lock().replace(keepalive) {
            previous.cancel();
        }
    }

    fn stop_keepalive(&self) {
        let keepalive = self.keepalive.lock().take();
        if let Some(keepalive) = keepalive {
            keepalive.cancel();
        }
    }

    fn listen_token(&self) -> CancellationToken {
        let mut token = self.listen_cancel.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }
}

async fn wait_opened(events: &mut Events) -> Result<()> {
    match events.recv().await {
        Some(ChannelEvent::Opened) => Ok(()),
        Some(ChannelEvent::Error(detail)) => Err(Vox8Error::Connection(detail)),
        Some(ChannelEvent::Closed { reason, .. }) => Err(Vox8Error::Connection(format!(
            "closed before open: {reason}"
        ))),
        Some(ChannelEvent::Frame(_)) => Err(Vox8Error::Connection(
            "frame received before the channel opened".into(),
        )),
        None => Err(Vox8Error::Connection("channel dropped before open".into())),
    }
}

async fn closed_signal(mut rx: watch::Receiver<bool>) {
    loop {
        let closed = *rx.borrow_and_update();
        if closed || rx.changed().await.is_err() {
            return;
        }
    }
}

fn channel_dropped() -> ChannelEvent {
    ChannelEvent::Closed {
        code: None,
        reason: "event channel dropped".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credential, VoiceMode};
    use crate::transport::{MemoryConnector, MemoryServer};
    use serde_json::{json, Value};
    use std::time::Duration;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn test_config() -> ClientConfig {
        ClientConfig::builder("es")
            .api_key("test-key")
            .endpoint("ws://memory")
            .open_timeout(ms(100))
            .ack_timeout(ms(100))
            .close_timeout(ms(100))
            .build()
            .unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        transcripts: Mutex<Vec<TranscriptEvent>>,
        audio: Mutex<Vec<u64>>,
        errors: Mutex<Vec<Vox8Error>>,
    }

    fn recording_client(config: ClientConfig) -> (Vox8Client, MemoryServer, Arc<Recorder>) {
        let (connector, server) = MemoryConnector::pair();
        let rec = Arc::new(Recorder::default());
        let (t, a, e) = (Arc::clone(&rec), Arc::clone(&rec), Arc::clone(&rec));
        let client = Vox8Client::builder(config)
            .connector(connector)
            .on_transcript(move |evt| {
                t.transcripts.lock().push(evt.clone());
                Ok(())
            })
            .on_audio(move |evt| {
                a.audio.lock().push(evt.sequence);
                Ok(())
            })
            .on_error(move |err| {
                e.errors.lock().push(err.clone());
                Ok(())
            })
            .build();
        (client, server, rec)
    }

    /// Run the handshake, answering `session_start` with `session_ready`.
    async fn establish(client: &Vox8Client, server: &mut MemoryServer) -> Value {
        let (result, start) = tokio::join!(client.connect(), async {
            let frame = server.next_frame().await.unwrap();
            server
                .send_json(json!({"type": "session_ready", "session_id": "s1"}))
                .await;
            serde_json::from_str::<Value>(&frame).unwrap()
        });
        result.unwrap();
        start
    }

    fn spawn_listener(client: &Vox8Client) -> tokio::task::JoinHandle<Result<()>> {
        let listener = client.clone();
        tokio::spawn(async move { listener.listen().await })
    }

    #[tokio::test]
    async fn connect_reaches_active_with_session_id() {
        let (client, mut server, _rec) = recording_client(test_config());
        assert_eq!(client.state(), SessionState::Idle);
        assert!(!client.is_connected());

        let start = establish(&client, &mut server).await;

        assert_eq!(client.state(), SessionState::Active);
        assert!(client.is_connected());
        assert_eq!(client.session_id().as_deref(), Some("s1"));
        assert_eq!(server.endpoint().as_deref(), Some("ws://memory"));

        assert_eq!(start["type"], "session_start");
        assert_eq!(start["api_key"], "test-key");
        assert_eq!(start["target_language"], "es");
        assert_eq!(start["source_language"], "auto");
        assert_eq!(start["voice_mode"], "match");
        assert_eq!(start["audio_format"], "pcm_s16le");
        assert!(start.get("session_token").is_none());
    }

    #[tokio::test]
    async fn session_start_carries_token_and_custom_languages() {
        let config = ClientConfig::builder("fr")
            .session_token("tok-123")
            .source_language("en")
            .voice_mode(VoiceMode::Female)
            .endpoint("ws://memory")
            .ack_timeout(ms(100))
            .build()
            .unwrap();
        let (client, mut server, _rec) = recording_client(config);

        let start = establish(&client, &mut server).await;

        assert_eq!(start["session_token"], "tok-123");
        assert!(start.get("api_key").is_none());
        assert_eq!(start["target_language"], "fr");
        assert_eq!(start["source_language"], "en");
        assert_eq!(start["voice_mode"], "female");
        assert!(matches!(
            client.config().credential(),
            Credential::SessionToken(_)
        ));
    }

    #[tokio::test]
    async fn send_before_connect_is_invalid_state() {
        let (client, mut server, _rec) = recording_client(test_config());

        let err = client.send_audio("AAAA").await.unwrap_err();
        assert!(matches!(
            err,
            Vox8Error::InvalidState {
                operation: "send_audio",
                state: SessionState::Idle
            }
        ));
        assert!(matches!(
            client.send_keepalive().await,
            Err(Vox8Error::InvalidState { .. })
        ));
        assert!(server.drain_frames().is_empty());
    }

    #[tokio::test]
    async fn send_while_awaiting_ack_writes_nothing() {
        let (client, mut server, _rec) = recording_client(test_config());

        let (result, ()) = tokio::join!(client.connect(), async {
            let start = server.next_command().await.unwrap().unwrap();
            assert_eq!(start.kind(), "session_start");

            let err = client.send_audio("AAAA").await.unwrap_err();
            assert!(matches!(
                err,
                Vox8Error::InvalidState {
                    state: SessionState::AwaitingSessionAck,
                    ..
                }
            ));
            assert!(server.drain_frames().is_empty());

            server
                .send_json(json!({"type": "session_ready", "session_id": "s1"}))
                .await;
        });
        result.unwrap();
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn audio_frames_are_written_in_call_order() {
        let (client, mut server, _rec) = recording_client(test_config());
        establish(&client, &mut server).await;

        client.send_audio("AAAA").await.unwrap();
        client.send_pcm(&[0, 1]).await.unwrap();
        client.send_keepalive().await.unwrap();

        assert_eq!(
            server.next_command().await.unwrap().unwrap(),
            OutboundCommand::AudioChunk {
                payload: "AAAA".into()
            }
        );
        assert_eq!(
            server.next_command().await.unwrap().unwrap(),
            OutboundCommand::AudioChunk {
                payload: "AAE=".into()
            }
        );
        assert_eq!(
            server.next_command().await.unwrap().unwrap(),
            OutboundCommand::Keepalive
        );
    }

    #[tokio::test]
    async fn empty_audio_is_rejected_before_the_transport() {
        let (client, mut server, _rec) = recording_client(test_config());
        establish(&client, &mut server).await;

        assert!(matches!(
            client.send_audio("").await,
            Err(Vox8Error::Encode(_))
        ));
        assert!(server.drain_frames().is_empty());
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn listen_delivers_events_in_order_and_skips_malformed_frames() {
        let (client, mut server, rec) = recording_client(test_config());
        establish(&client, &mut server).await;
        let listener = spawn_listener(&client);

        server
            .send_json(json!({"type": "transcript", "text": "hello", "is_final": false}))
            .await;
        server.send_frame("this is not json").await;
        server
            .send_json(json!({
                "type": "transcript",
                "text": "hello there",
                "is_final": true,
                "translation": "hola"
            }))
            .await;
        for seq in [1, 2, 3] {
            server
                .send_json(json!({"type": "audio", "audio": "AAAA", "sequence": seq}))
                .await;
        }
        server.send_json(json!({"type": "usage", "seconds": 4})).await;
        server.close(1000, "bye").await;

        listener.await.unwrap().unwrap();
        assert_eq!(client.state(), SessionState::Closed);

        let transcripts = rec.transcripts.lock();
        assert_eq!(transcripts.len(), 2);
        assert!(!transcripts[0].is_final);
        assert_eq!(transcripts[1].translation.as_deref(), Some("hola"));
        assert_eq!(*rec.audio.lock(), vec![1, 2, 3]);

        let errors = rec.errors.lock();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], Vox8Error::Decode(_)));
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_the_loop() {
        let (connector, mut server) = MemoryConnector::pair();
        let rec = Arc::new(Recorder::default());
        let (t, e) = (Arc::clone(&rec), Arc::clone(&rec));
        let client = Vox8Client::builder(test_config())
            .connector(connector)
            .on_transcript(move |evt| {
                if evt.text == "boom" {
                    anyhow::bail!("cannot render");
                }
                t.transcripts.lock().push(evt.clone());
                Ok(())
            })
            .on_error(move |err| {
                e.errors.lock().push(err.clone());
                Ok(())
            })
            .build();
        establish(&client, &mut server).await;
        let listener = spawn_listener(&client);

        server
            .send_json(json!({"type": "transcript", "text": "boom", "is_final": false}))
            .await;
        server
            .send_json(json!({"type": "transcript", "text": "fine", "is_final": false}))
            .await;
        server.close(1000, "bye").await;
        listener.await.unwrap().unwrap();

        assert_eq!(rec.transcripts.lock()[0].text, "fine");
        let errors = rec.errors.lock();
        assert!(matches!(
            &errors[0],
            Vox8Error::Callback { handler: "transcript", message } if message.contains("cannot render")
        ));
    }

    #[tokio::test]
    async fn graceful_disconnect_with_listener_running() {
        let (client, mut server, _rec) = recording_client(test_config());
        establish(&client, &mut server).await;
        let listener = spawn_listener(&client);

        let (result, ()) = tokio::join!(client.disconnect(), async {
            let cmd = server.next_command().await.unwrap().unwrap();
            assert_eq!(cmd, OutboundCommand::EndSession);
            server.close(1000, "session ended").await;
        });
        result.unwrap();
        listener.await.unwrap().unwrap();

        assert_eq!(client.state(), SessionState::Closed);
        assert_eq!(client.session_id().as_deref(), Some("s1"));

        // Second disconnect is a no-op; sends are refused.
        client.disconnect().await.unwrap();
        assert!(matches!(
            client.send_audio("AAAA").await,
            Err(Vox8Error::NotConnected(SessionState::Closed))
        ));
        assert!(server.drain_frames().is_empty());
    }

    #[tokio::test]
    async fn disconnect_without_listener_drains_remaining_events() {
        let (client, mut server, rec) = recording_client(test_config());
        establish(&client, &mut server).await;

        let (result, ()) = tokio::join!(client.disconnect(), async {
            let cmd = server.next_command().await.unwrap().unwrap();
            assert_eq!(cmd, OutboundCommand::EndSession);
            server
                .send_json(json!({
                    "type": "transcript",
                    "text": "last words",
                    "is_final": true,
                    "translation": "ultimas palabras"
                }))
                .await;
            server.close(1000, "session ended").await;
        });
        result.unwrap();

        assert_eq!(client.state(), SessionState::Closed);
        assert_eq!(rec.transcripts.lock()[0].text, "last words");
        assert!(matches!(
            client.listen().await,
            Err(Vox8Error::NotConnected(SessionState::Closed))
        ));
    }

    #[tokio::test]
    async fn disconnect_times_out_when_channel_never_closes() {
        let (client, mut server, _rec) = recording_client(test_config());
        establish(&client, &mut server).await;

        let err = client.disconnect().await.unwrap_err();
        assert!(matches!(
            err,
            Vox8Error::Timeout {
                kind: TimeoutKind::Close,
                ..
            }
        ));
        assert_eq!(client.state(), SessionState::Failed);
        assert_eq!(
            server.next_command().await.unwrap().unwrap(),
            OutboundCommand::EndSession
        );
    }

    #[tokio::test]
    async fn dropped_disconnect_is_finished_by_the_next_one() {
        let (client, mut server, _rec) = recording_client(test_config());
        establish(&client, &mut server).await;

        let first = tokio::time::timeout(ms(10), client.disconnect()).await;
        assert!(first.is_err());
        assert_eq!(client.state(), SessionState::Closing);
        assert_eq!(
            server.next_command().await.unwrap().unwrap(),
            OutboundCommand::EndSession
        );

        server.close(1000, "session ended").await;
        client.disconnect().await.unwrap();
        assert_eq!(client.state(), SessionState::Closed);
        assert!(matches!(
            client.send_audio("AAAA").await,
            Err(Vox8Error::NotConnected(SessionState::Closed))
        ));
    }

    #[tokio::test]
    async fn dropped_disconnect_then_silent_server_fails() {
        let (client, mut server, _rec) = recording_client(test_config());
        establish(&client, &mut server).await;

        assert!(tokio::time::timeout(ms(10), client.disconnect())
            .await
            .is_err());

        let err = client.disconnect().await.unwrap_err();
        assert!(matches!(
            err,
            Vox8Error::Timeout {
                kind: TimeoutKind::Close,
                ..
            }
        ));
        assert_eq!(client.state(), SessionState::Failed);
        assert!(matches!(
            client.send_audio("AAAA").await,
            Err(Vox8Error::NotConnected(SessionState::Failed))
        ));
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn ack_timeout_fails_the_session() {
        let (client, mut server, _rec) = recording_client(test_config());

        let err = client.connect().await.unwrap_err();
        assert!(matches!(
            err,
            Vox8Error::Timeout {
                kind: TimeoutKind::SessionAck,
                ..
            }
        ));
        assert_eq!(client.state(), SessionState::Failed);
        assert!(client.session_id().is_none());

        // session_start went out before the wait.
        assert_eq!(server.drain_frames().len(), 1);
        assert!(matches!(
            client.send_audio("AAAA").await,
            Err(Vox8Error::NotConnected(SessionState::Failed))
        ));
        assert!(matches!(
            client.connect().await,
            Err(Vox8Error::NotConnected(SessionState::Failed))
        ));
    }

    #[tokio::test]
    async fn stalled_open_times_out() {
        let client = Vox8Client::builder(test_config())
            .connector(MemoryConnector::stalled())
            .build();
        let err = client.connect().await.unwrap_err();
        assert!(matches!(
            err,
            Vox8Error::Timeout {
                kind: TimeoutKind::Open,
                ..
            }
        ));
        assert_eq!(client.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn refused_open_is_connection_error() {
        let client = Vox8Client::builder(test_config())
            .connector(MemoryConnector::refusing())
            .build();
        assert!(matches!(
            client.connect().await,
            Err(Vox8Error::Connection(_))
        ));
        assert_eq!(client.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn server_error_during_handshake_fails_connect() {
        let (client, mut server, rec) = recording_client(test_config());

        let (result, ()) = tokio::join!(client.connect(), async {
            server.next_frame().await.unwrap();
            server
                .send_json(json!({
                    "type": "error",
                    "code": "invalid_api_key",
                    "message": "key revoked"
                }))
                .await;
        });

        assert!(matches!(
            result,
            Err(Vox8Error::Server { ref code, .. }) if code == "invalid_api_key"
        ));
        assert_eq!(client.state(), SessionState::Failed);
        assert_eq!(rec.errors.lock().len(), 1);
    }

    #[tokio::test]
    async fn malformed_frame_during_handshake_fails_connect() {
        let (client, mut server, _rec) = recording_client(test_config());

        let (result, ()) = tokio::join!(client.connect(), async {
            server.next_frame().await.unwrap();
            server.send_frame("{not json").await;
        });

        assert!(matches!(result, Err(Vox8Error::Decode(_))));
        assert_eq!(client.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn malformed_session_ready_fails_connect() {
        let (client, mut server, _rec) = recording_client(test_config());

        let (result, ()) = tokio::join!(client.connect(), async {
            server.next_frame().await.unwrap();
            server.send_json(json!({"type": "session_ready"})).await;
        });

        assert!(matches!(result, Err(Vox8Error::Decode(_))));
        assert_eq!(client.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn malformed_event_before_ack_is_dropped() {
        let (client, mut server, rec) = recording_client(test_config());

        let (result, ()) = tokio::join!(client.connect(), async {
            server.next_frame().await.unwrap();
            server
                .send_json(json!({"type": "transcript", "text": "early"}))
                .await;
            server
                .send_json(json!({"type": "session_ready", "session_id": "s1"}))
                .await;
        });

        result.unwrap();
        assert_eq!(client.state(), SessionState::Active);
        assert_eq!(client.session_id().as_deref(), Some("s1"));
        assert!(rec.transcripts.lock().is_empty());
        let errors = rec.errors.lock();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], Vox8Error::Decode(_)));
    }

    #[tokio::test]
    async fn open_and_opened_share_one_deadline() {
        let (connector, _server) = MemoryConnector::pair();
        let client = Vox8Client::builder(test_config())
            .connector(SlowOpen {
                inner: connector,
                delay: ms(80),
            })
            .build();

        let started = tokio::time::Instant::now();
        let err = client.connect().await.unwrap_err();

        assert!(matches!(
            err,
            Vox8Error::Timeout {
                kind: TimeoutKind::Open,
                ..
            }
        ));
        assert!(started.elapsed() < ms(150), "took {:?}", started.elapsed());
    }

    /// Opens after `delay`, then withholds `Opened` until the same delay
    /// passes again.
    struct SlowOpen {
        inner: MemoryConnector,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl Connector for SlowOpen {
        async fn open(&self, endpoint: &str) -> Result<(Box<dyn FrameSink>, Events)> {
            tokio::time::sleep(self.delay).await;
            let (sink, mut events) = self.inner.open(endpoint).await?;
            let opened = events.recv().await;
            let (tx, rx) = mpsc::channel(8);
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(event) = opened {
                    let _ = tx.send(event).await;
                }
            });
            Ok((sink, rx))
        }
    }

    #[tokio::test]
    async fn server_close_during_handshake_fails_connect() {
        let (client, mut server, _rec) = recording_client(test_config());

        let (result, ()) = tokio::join!(client.connect(), async {
            server.next_frame().await.unwrap();
            server.close(1008, "policy violation").await;
        });

        assert!(matches!(result, Err(Vox8Error::Connection(msg)) if msg.contains("policy violation")));
        assert_eq!(client.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn disconnect_during_handshake_aborts() {
        let (client, mut server, _rec) = recording_client(test_config());

        let (result, ()) = tokio::join!(client.connect(), async {
            server.next_frame().await.unwrap();
            client.disconnect().await.unwrap();
        });

        assert!(result.is_err());
        assert_eq!(client.state(), SessionState::Closed);
        assert!(client.session_id().is_none());
    }

    #[tokio::test]
    async fn connect_twice_is_invalid_state() {
        let (client, mut server, _rec) = recording_client(test_config());
        establish(&client, &mut server).await;

        assert!(matches!(
            client.connect().await,
            Err(Vox8Error::InvalidState {
                operation: "connect",
                state: SessionState::Active
            })
        ));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn non_fatal_server_error_keeps_session_active() {
        let (client, mut server, rec) = recording_client(test_config());
        establish(&client, &mut server).await;
        let listener = spawn_listener(&client);

        server
            .send_json(json!({"type": "error", "code": "rate_limited", "message": "slow down"}))
            .await;
        server
            .send_json(json!({"type": "transcript", "text": "still here", "is_final": false}))
            .await;
        tokio::time::sleep(ms(30)).await;

        assert!(client.is_connected());
        assert_eq!(rec.transcripts.lock().len(), 1);
        assert!(matches!(
            &rec.errors.lock()[0],
            Vox8Error::Server { code, .. } if code == "rate_limited"
        ));

        client.cancel_listen();
        listener.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn fatal_server_error_ends_the_session() {
        let (client, mut server, rec) = recording_client(test_config());
        establish(&client, &mut server).await;
        let listener = spawn_listener(&client);

        server
            .send_json(json!({
                "type": "error",
                "code": "session_expired",
                "message": "session timed out"
            }))
            .await;
        listener.await.unwrap().unwrap();

        assert_eq!(client.state(), SessionState::Failed);
        assert_eq!(rec.errors.lock().len(), 1);
        assert!(matches!(
            client.send_audio("AAAA").await,
            Err(Vox8Error::NotConnected(SessionState::Failed))
        ));
    }

    #[tokio::test]
    async fn server_hangup_while_active_closes() {
        let (client, mut server, _rec) = recording_client(test_config());
        establish(&client, &mut server).await;
        let listener = spawn_listener(&client);

        server.close(1001, "going away").await;
        listener.await.unwrap().unwrap();
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn transport_error_fails_the_session() {
        let (client, mut server, rec) = recording_client(test_config());
        establish(&client, &mut server).await;
        let listener = spawn_listener(&client);

        server.fail("connection reset").await;
        let result = listener.await.unwrap();

        assert!(matches!(result, Err(Vox8Error::Connection(_))));
        assert_eq!(client.state(), SessionState::Failed);
        assert!(matches!(rec.errors.lock()[0], Vox8Error::Connection(_)));
    }

    #[tokio::test]
    async fn listen_rules() {
        let (client, mut server, _rec) = recording_client(test_config());
        assert!(matches!(
            client.listen().await,
            Err(Vox8Error::InvalidState {
                operation: "listen",
                state: SessionState::Idle
            })
        ));

        establish(&client, &mut server).await;
        let first = spawn_listener(&client);
        tokio::time::sleep(ms(20)).await;
        assert!(matches!(
            client.listen().await,
            Err(Vox8Error::AlreadyListening)
        ));

        client.cancel_listen();
        first.await.unwrap().unwrap();
        assert!(client.is_connected());

        // The channel is handed back, so a new loop picks up where it left off.
        let second = spawn_listener(&client);
        server.close(1000, "bye").await;
        second.await.unwrap().unwrap();
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn keepalive_runs_while_active_and_stops_on_disconnect() {
        let config = ClientConfig::builder("es")
            .api_key("test-key")
            .endpoint("ws://memory")
            .ack_timeout(ms(100))
            .close_timeout(ms(200))
            .keepalive(ms(20))
            .build()
            .unwrap();
        let (client, mut server, _rec) = recording_client(config);
        establish(&client, &mut server).await;

        assert_eq!(
            server.next_command_within(ms(200)).await.unwrap().unwrap(),
            OutboundCommand::Keepalive
        );

        let (result, ()) = tokio::join!(client.disconnect(), async {
            loop {
                let cmd = server.next_command().await.unwrap().unwrap();
                if cmd == OutboundCommand::EndSession {
                    break;
                }
                assert_eq!(cmd, OutboundCommand::Keepalive);
            }
            server.close(1000, "bye").await;
        });
        result.unwrap();

        tokio::time::sleep(ms(80)).await;
        assert!(server.drain_frames().is_empty());
    }

    #[tokio::test]
    async fn no_keepalive_unless_configured() {
        let (client, mut server, _rec) = recording_client(test_config());
        establish(&client, &mut server).await;
        assert!(server.next_command_within(ms(60)).await.is_none());
    }
}
