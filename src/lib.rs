//! Client for the vox8 real-time speech translation service.
//!
//! Stream microphone audio over a persistent WebSocket session and receive
//! transcripts, translations and synthesized speech back.
//!
//! ## Design
//! - Explicit session state machine (`session`) gating every operation
//! - JSON wire codec with deterministic encoding (`protocol`)
//! - Transport seam (`transport::Connector`) with WebSocket and in-memory backends
//! - Synchronous, ordered handler dispatch with panic containment (`dispatch`)
//! - Optional keepalive task bound to the active session (`keepalive`)
//!
//! ```no_run
//! use vox8::{ClientConfig, Vox8Client};
//!
//! # async fn run() -> vox8::Result<()> {
//! let config = ClientConfig::builder("es").api_key("vx-key").build()?;
//! let client = Vox8Client::builder(config)
//!     .on_transcript(|t| {
//!         println!("{} -> {:?}", t.text, t.translation);
//!         Ok(())
//!     })
//!     .build();
//!
//! client.connect().await?;
//! let listener = client.clone();
//! tokio::spawn(async move { listener.listen().await });
//! client.send_pcm(&[0u8; 3200]).await?;
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod keepalive;
pub mod protocol;
pub mod session;
pub mod transport;

pub use client::{ClientBuilder, Vox8Client};
pub use config::{ClientConfig, ClientConfigBuilder, Credential, Timeouts, VoiceMode};
pub use error::{Result, TimeoutKind, Vox8Error};
pub use protocol::{AudioEvent, ErrorEvent, InboundEvent, OutboundCommand, TranscriptEvent};
pub use session::SessionState;
