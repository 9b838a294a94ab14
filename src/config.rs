//! Client configuration.
//!
//! [`ClientConfig`] is immutable once built. Use [`ClientConfig::builder`]
//! or load a TOML file with [`ClientConfig::from_toml_str`] /
//! [`ClientConfig::load`]; every path goes through the same validation.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, Vox8Error};

// ── Defaults ───────────────────────────────────────────────────────

/// Default vox8 WebSocket endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://api.vox8.io/v1/translate";

/// Source language sentinel asking the service to detect the language.
pub const AUTO_SOURCE_LANGUAGE: &str = "auto";

/// Audio format announced in `session_start` (16kHz mono PCM, 16-bit LE).
pub const DEFAULT_AUDIO_FORMAT: &str = "pcm_s16le";

/// Default bound for opening the transport.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound for the `session_ready` acknowledgement.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(15);

/// Default bound for the transport to close after `session_end`.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Keepalive period the service recommends when no audio is flowing.
pub const RECOMMENDED_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Server error codes that end the session by default.
pub const DEFAULT_FATAL_ERROR_CODES: &[&str] = &[
    "invalid_api_key",
    "invalid_session_token",
    "unauthorized",
    "session_expired",
    "quota_exceeded",
];

// ── Voice mode ─────────────────────────────────────────────────────

/// How the translated speech should sound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceMode {
    /// Preserve the speaker's voice.
    #[default]
    Match,
    Male,
    Female,
}

impl VoiceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Match => "match",
            Self::Male => "male",
            Self::Female => "female",
        }
    }
}

impl fmt::Display for VoiceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoiceMode {
    type Err = Vox8Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "match" => Ok(Self::Match),
            "male" => Ok(Self::Male),
            "female" => Ok(Self::Female),
            other => Err(Vox8Error::Config(format!(
                "unknown voice mode `{other}` (expected match, male or female)"
            ))),
        }
    }
}

// ── Credential ─────────────────────────────────────────────────────

/// Authentication sent in `session_start`.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Long-lived API key, for server-side callers.
    ApiKey(String),
    /// Pre-issued short-lived session token.
    SessionToken(String),
}

impl Credential {
    /// Wire field name carrying this credential.
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::ApiKey(_) => "api_key",
            Self::SessionToken(_) => "session_token",
        }
    }

    pub fn secret(&self) -> &str {
        match self {
            Self::ApiKey(s) | Self::SessionToken(s) => s,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::ApiKey(_) => "ApiKey",
            Self::SessionToken(_) => "SessionToken",
        };
        f.debug_tuple(kind).field(&"<redacted>").finish()
    }
}

// ── Timeouts ───────────────────────────────────────────────────────

/// Bounds for every wait the client performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub open: Duration,
    pub session_ack: Duration,
    pub close: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            open: DEFAULT_OPEN_TIMEOUT,
            session_ack: DEFAULT_ACK_TIMEOUT,
            close: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

// ── ClientConfig ───────────────────────────────────────────────────

/// Validated, immutable client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    target_language: String,
    source_language: String,
    voice_mode: VoiceMode,
    credential: Credential,
    endpoint: String,
    audio_format: String,
    timeouts: Timeouts,
    keepalive_interval: Option<Duration>,
    fatal_error_codes: BTreeSet<String>,
}

impl ClientConfig {
    /// Start building a config for the given target language.
    pub fn builder(target_language: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder::new(target_language)
    }

    /// Parse a TOML document (see [`ConfigFile`]).
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(text)
            .map_err(|e| Vox8Error::Config(format!("invalid config file: {e}")))?;
        file.into_builder()?.build()
    }

    /// Read and parse a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Vox8Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn target_language(&self) -> &str {
        &self.target_language
    }

    pub fn source_language(&self) -> &str {
        &self.source_language
    }

    pub fn voice_mode(&self) -> VoiceMode {
        self.voice_mode
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn audio_format(&self) -> &str {
        &self.audio_format
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// `None` when automatic keepalive is disabled.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.keepalive_interval
    }

    /// Whether a server error with this code ends the session.
    pub fn is_fatal_error(&self, code: &str) -> bool {
        self.fatal_error_codes.contains(code)
    }
}

/// Builder for [`ClientConfig`]. Validation happens in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    target_language: String,
    source_language: String,
    voice_mode: VoiceMode,
    api_key: Option<String>,
    session_token: Option<String>,
    endpoint: String,
    audio_format: String,
    timeouts: Timeouts,
    keepalive_interval: Option<Duration>,
    fatal_error_codes: BTreeSet<String>,
}

impl ClientConfigBuilder {
    pub fn new(target_language: impl Into<String>) -> Self {
        Self {
            target_language: target_language.into(),
            source_language: AUTO_SOURCE_LANGUAGE.to_string(),
            voice_mode: VoiceMode::default(),
            api_key: None,
            session_token: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            audio_format: DEFAULT_AUDIO_FORMAT.to_string(),
            timeouts: Timeouts::default(),
            keepalive_interval: None,
            fatal_error_codes: DEFAULT_FATAL_ERROR_CODES
                .iter()
                .map(|c| (*c).to_string())
                .collect(),
        }
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn source_language(mut self, lang: impl Into<String>) -> Self {
        self.source_language = lang.into();
        self
    }

    pub fn voice_mode(mut self, mode: VoiceMode) -> Self {
        self.voice_mode = mode;
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn audio_format(mut self, format: impl Into<String>) -> Self {
        self.audio_format = format.into();
        self
    }

    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.open = timeout;
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.session_ack = timeout;
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.close = timeout;
        self
    }

    /// Emit a keepalive every `interval` while the session is active.
    pub fn keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    /// Replace the set of server error codes treated as fatal.
    pub fn fatal_error_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fatal_error_codes = codes.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> Result<ClientConfig> {
        let credential = match (non_empty(self.api_key), non_empty(self.session_token)) {
            (Some(key), None) => Credential::ApiKey(key),
            (None, Some(token)) => Credential::SessionToken(token),
            (None, None) => {
                return Err(Vox8Error::Config(
                    "either api_key or session_token must be provided".into(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(Vox8Error::Config(
                    "api_key and session_token are mutually exclusive".into(),
                ))
            }
        };

        let target_language = self.target_language.trim().to_string();
        if target_language.is_empty() {
            return Err(Vox8Error::Config("target_language is required".into()));
        }

        let source_language = match self.source_language.trim() {
            "" => AUTO_SOURCE_LANGUAGE.to_string(),
            lang => lang.to_string(),
        };

        let endpoint = self.endpoint.trim().to_string();
        if !(endpoint.starts_with("wss://") || endpoint.starts_with("ws://")) {
            return Err(Vox8Error::Config(format!(
                "endpoint must be a ws:// or wss:// URL, got `{endpoint}`"
            )));
        }

        if self.audio_format.trim().is_empty() {
            return Err(Vox8Error::Config("audio_format cannot be empty".into()));
        }

        let Timeouts {
            open,
            session_ack,
            close,
        } = self.timeouts;
        if open.is_zero() || session_ack.is_zero() || close.is_zero() {
            return Err(Vox8Error::Config("timeouts must be non-zero".into()));
        }
        if self.keepalive_interval.is_some_and(|i| i.is_zero()) {
            return Err(Vox8Error::Config(
                "keepalive interval must be non-zero".into(),
            ));
        }

        Ok(ClientConfig {
            target_language,
            source_language,
            voice_mode: self.voice_mode,
            credential,
            endpoint,
            audio_format: self.audio_format,
            timeouts: self.timeouts,
            keepalive_interval: self.keepalive_interval,
            fatal_error_codes: self.fatal_error_codes,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// ── File format ────────────────────────────────────────────────────

/// On-disk configuration.
///
/// ```toml
/// target_language = "es"
/// source_language = "en"
/// voice_mode = "female"
/// api_key = "vox8_xxx"
/// keepalive_secs = 15
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub target_language: Option<String>,
    pub source_language: Option<String>,
    pub voice_mode: Option<String>,
    pub api_key: Option<String>,
    pub session_token: Option<String>,
    pub endpoint: Option<String>,
    pub audio_format: Option<String>,
    pub open_timeout_secs: Option<u64>,
    pub ack_timeout_secs: Option<u64>,
    pub close_timeout_secs: Option<u64>,
    pub keepalive_secs: Option<u64>,
    pub fatal_error_codes: Option<Vec<String>>,
}

impl ConfigFile {
    pub fn into_builder(self) -> Result<ClientConfigBuilder> {
        let target = self
            .target_language
            .ok_or_else(|| Vox8Error::Config("target_language is required".into()))?;
        let mut builder = ClientConfigBuilder::new(target);

        if let Some(lang) = self.source_language {
            builder = builder.source_language(lang);
        }
        if let Some(mode) = self.voice_mode {
            builder = builder.voice_mode(mode.parse()?);
        }
        if let Some(key) = self.api_key {
            builder = builder.api_key(key);
        }
        if let Some(token) = self.session_token {
            builder = builder.session_token(token);
        }
        if let Some(endpoint) = self.endpoint {
            builder = builder.endpoint(endpoint);
        }
        if let Some(format) = self.audio_format {
            builder = builder.audio_format(format);
        }
        if let Some(secs) = self.open_timeout_secs {
            builder = builder.open_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.ack_timeout_secs {
            builder = builder.ack_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.close_timeout_secs {
            builder = builder.close_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.keepalive_secs {
            builder = builder.keepalive(Duration::from_secs(secs));
        }
        if let Some(codes) = self.fatal_error_codes {
            builder = builder.fatal_error_codes(codes);
        }
        Ok(builder)
    }
}
