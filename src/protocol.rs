//! Wire protocol for the vox8 translation stream.
//!
//! All frames are JSON text objects discriminated by a `type` field.
//!
//! ```text
//! client ──session_start──▸ server
//!        ◂─session_ready───
//!        ──audio──────────▸           (repeated)
//!        ◂─transcript / audio / error (any order)
//!        ──keepalive──────▸           (optional, periodic)
//!        ──session_end────▸
//! ```
//!
//! Encoding goes through `serde_json::Value`, whose object map is ordered by
//! key, so the same command always produces the same bytes.

use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::{ClientConfig, Credential, VoiceMode};
use crate::error::{Result, Vox8Error};

// ── Outbound ───────────────────────────────────────────────────────

/// Commands sent from the client to the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundCommand {
    /// Authenticate and open a translation session.
    StartSession {
        credential: Credential,
        target_language: String,
        source_language: String,
        voice_mode: VoiceMode,
        audio_format: String,
    },
    /// One chunk of base64-encoded audio.
    AudioChunk { payload: String },
    Keepalive,
    EndSession,
}

impl OutboundCommand {
    /// Build the `session_start` command for a config.
    pub fn start_session(config: &ClientConfig) -> Self {
        Self::StartSession {
            credential: config.credential().clone(),
            target_language: config.target_language().to_string(),
            source_language: config.source_language().to_string(),
            voice_mode: config.voice_mode(),
            audio_format: config.audio_format().to_string(),
        }
    }

    /// Wire `type` discriminator.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartSession { .. } => "session_start",
            Self::AudioChunk { .. } => "audio",
            Self::Keepalive => "keepalive",
            Self::EndSession => "session_end",
        }
    }
}

/// Serialize a command into a text frame.
///
/// Fails with [`Vox8Error::Encode`] before anything reaches the transport
/// when a required value is empty.
pub fn encode(command: &OutboundCommand) -> Result<String> {
    let value = match command {
        OutboundCommand::StartSession {
            credential,
            target_language,
            source_language,
            voice_mode,
            audio_format,
        } => {
            if credential.secret().trim().is_empty() {
                return Err(Vox8Error::Encode(format!(
                    "{} cannot be empty",
                    credential.field_name()
                )));
            }
            if target_language.trim().is_empty() {
                return Err(Vox8Error::Encode("target_language cannot be empty".into()));
            }
            let mut value = json!({
                "type": command.kind(),
                "target_language": target_language,
                "source_language": source_language,
                "voice_mode": voice_mode.as_str(),
                "audio_format": audio_format,
            });
            value[credential.field_name()] = Value::String(credential.secret().to_string());
            value
        }
        OutboundCommand::AudioChunk { payload } => {
            if payload.is_empty() {
                return Err(Vox8Error::Encode("audio payload cannot be empty".into()));
            }
            json!({ "type": command.kind(), "audio": payload })
        }
        OutboundCommand::Keepalive | OutboundCommand::EndSession => {
            json!({ "type": command.kind() })
        }
    };

    serde_json::to_string(&value).map_err(|e| Vox8Error::Encode(e.to_string()))
}

/// Build an [`OutboundCommand::AudioChunk`] from raw PCM bytes.
pub fn audio_chunk_from_pcm(pcm: &[u8]) -> OutboundCommand {
    OutboundCommand::AudioChunk {
        payload: base64::engine::general_purpose::STANDARD.encode(pcm),
    }
}

/// Parse a client frame back into a command, as a server would.
///
/// Accepts both the live wire names and the descriptive aliases
/// (`start_session`, `end_session`).
pub fn decode_command(text: &str) -> Result<OutboundCommand> {
    let value: Value = serde_json::from_str(text).map_err(Vox8Error::decode)?;
    let kind = frame_type(&value)?.to_string();

    match kind.as_str() {
        "session_start" | "start_session" => {
            let frame: StartSessionFrame =
                serde_json::from_value(value).map_err(Vox8Error::decode)?;
            let credential = match (frame.api_key, frame.session_token) {
                (Some(key), None) => Credential::ApiKey(key),
                (None, Some(token)) => Credential::SessionToken(token),
                _ => {
                    return Err(Vox8Error::Decode(
                        "session_start needs exactly one of api_key or session_token".into(),
                    ))
                }
            };
            Ok(OutboundCommand::StartSession {
                credential,
                target_language: frame.target_language,
                source_language: frame.source_language,
                voice_mode: frame.voice_mode,
                audio_format: frame.audio_format,
            })
        }
        "audio" => {
            let frame: AudioChunkFrame = serde_json::from_value(value).map_err(Vox8Error::decode)?;
            Ok(OutboundCommand::AudioChunk {
                payload: frame.audio,
            })
        }
        "keepalive" => Ok(OutboundCommand::Keepalive),
        "session_end" | "end_session" => Ok(OutboundCommand::EndSession),
        other => Err(Vox8Error::Decode(format!("unknown command type `{other}`"))),
    }
}

#[derive(Deserialize)]
struct StartSessionFrame {
    api_key: Option<String>,
    session_token: Option<String>,
    target_language: String,
    source_language: String,
    voice_mode: VoiceMode,
    audio_format: String,
}

#[derive(Deserialize)]
struct AudioChunkFrame {
    audio: String,
}

// ── Inbound ────────────────────────────────────────────────────────

/// A transcript of the speaker's words.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
    /// Present only on final transcripts.
    #[serde(default)]
    pub translation: Option<String>,
}

/// A chunk of translated speech.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AudioEvent {
    /// Base64-encoded audio, passed through untouched.
    pub audio: String,
    /// Position of this chunk in the session's audio stream.
    pub sequence: u64,
    #[serde(default)]
    pub original_text: String,
    #[serde(default)]
    pub translated_text: String,
}

impl AudioEvent {
    /// Decode the base64 payload into raw audio bytes.
    pub fn decode_audio(&self) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.audio)
            .map_err(Vox8Error::decode)
    }
}

/// Error reported by the service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorEvent {
    #[serde(default = "unknown_code")]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

fn unknown_code() -> String {
    "unknown".to_string()
}

impl From<ErrorEvent> for Vox8Error {
    fn from(event: ErrorEvent) -> Self {
        Vox8Error::Server {
            code: event.code,
            message: event.message,
        }
    }
}

/// Events received from the service.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    SessionStarted { session_id: String },
    Transcript(TranscriptEvent),
    Audio(AudioEvent),
    Error(ErrorEvent),
    /// A frame with a `type` this client does not know about.
    Unrecognized { kind: String, raw: Value },
}

impl InboundEvent {
    /// Short name used in logs.
    pub fn kind(&self) -> &str {
        match self {
            Self::SessionStarted { .. } => "session_ready",
            Self::Transcript(_) => "transcript",
            Self::Audio(_) => "audio",
            Self::Error(_) => "error",
            Self::Unrecognized { kind, .. } => kind,
        }
    }
}

#[derive(Deserialize)]
struct SessionReadyFrame {
    session_id: String,
}

/// Parse a server frame.
pub fn decode(text: &str) -> Result<InboundEvent> {
    let value: Value = serde_json::from_str(text).map_err(Vox8Error::decode)?;
    let kind = frame_type(&value)?.to_string();

    let event = match kind.as_str() {
        "session_ready" | "session_started" => {
            let frame: SessionReadyFrame =
                serde_json::from_value(value).map_err(Vox8Error::decode)?;
            if frame.session_id.is_empty() {
                return Err(Vox8Error::Decode("empty session_id".into()));
            }
            InboundEvent::SessionStarted {
                session_id: frame.session_id,
            }
        }
        "transcript" => {
            let mut transcript: TranscriptEvent =
                serde_json::from_value(value).map_err(Vox8Error::decode)?;
            if !transcript.is_final && transcript.translation.take().is_some() {
                tracing::debug!("Dropping translation attached to a partial transcript");
            }
            if transcript.is_final && transcript.translation.is_none() {
                tracing::warn!("Final transcript arrived without a translation");
            }
            InboundEvent::Transcript(transcript)
        }
        "audio" => {
            InboundEvent::Audio(serde_json::from_value(value).map_err(Vox8Error::decode)?)
        }
        "error" => InboundEvent::Error(serde_json::from_value(value).map_err(Vox8Error::decode)?),
        _ => InboundEvent::Unrecognized { kind, raw: value },
    };

    Ok(event)
}

/// The `type` of a frame that is at least a JSON object with a string
/// `type`, even when the rest of it does not decode.
pub fn frame_kind(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    frame_type(&value).ok().map(str::to_owned)
}

/// Whether `kind` names the session acknowledgement.
pub fn is_session_ack(kind: &str) -> bool {
    matches!(kind, "session_ready" | "session_started")
}

fn frame_type(value: &Value) -> Result<&str> {
    if !value.is_object() {
        return Err(Vox8Error::Decode("frame is not a JSON object".into()));
    }
    value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Vox8Error::Decode("frame has no string `type` field".into()))
}

// ── Tests ──────────────────────────────────────────────────────────
