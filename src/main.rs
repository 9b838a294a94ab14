//! `vox8` command-line streamer.
//!
//! Streams a raw PCM file (signed 16-bit little-endian, 16 kHz mono) to the
//! service at real-time pace and prints transcripts as they arrive.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

use vox8::config::{ConfigFile, RECOMMENDED_KEEPALIVE_INTERVAL};
use vox8::{ClientConfig, Vox8Client};

/// 100 ms of 16 kHz mono s16le.
const DEFAULT_CHUNK_BYTES: usize = 3200;
const BYTES_PER_SECOND: u64 = 32_000;

#[derive(Parser)]
#[command(name = "vox8")]
#[command(about = "Stream audio to vox8 and print live translations", long_about = None)]
struct Cli {
    /// Raw PCM input (s16le, 16 kHz, mono). Use `-` for stdin.
    input: PathBuf,

    /// TOML config file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Target language code
    #[arg(short, long)]
    target: Option<String>,

    /// Source language code (default: auto-detect)
    #[arg(short, long)]
    source: Option<String>,

    /// Voice mode: match, male or female
    #[arg(long)]
    voice: Option<String>,

    /// API key (falls back to VOX8_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    /// Short-lived session token instead of an API key
    #[arg(long)]
    session_token: Option<String>,

    /// Service endpoint
    #[arg(long)]
    endpoint: Option<String>,

    /// Send a keepalive every N seconds (default: 15)
    #[arg(long, conflicts_with = "no_keepalive")]
    keepalive_secs: Option<u64>,

    /// Never send keepalives
    #[arg(long)]
    no_keepalive: bool,

    /// Bytes of PCM per audio frame
    #[arg(long, default_value_t = DEFAULT_CHUNK_BYTES)]
    chunk_bytes: usize,

    /// Send as fast as possible instead of at real-time pace
    #[arg(long)]
    no_pacing: bool,

    /// Write the synthesized translation audio here
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Seconds to keep listening after the last chunk
    #[arg(long, default_value_t = 3)]
    linger_secs: u64,
}

impl Cli {
    fn client_config(&self) -> Result<ClientConfig> {
        let mut file = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                toml::from_str::<ConfigFile>(&text)
                    .with_context(|| format!("invalid config file {}", path.display()))?
            }
            None => ConfigFile::default(),
        };

        if let Some(target) = &self.target {
            file.target_language = Some(target.clone());
        }
        if let Some(source) = &self.source {
            file.source_language = Some(source.clone());
        }
        if let Some(voice) = &self.voice {
            file.voice_mode = Some(voice.clone());
        }
        if let Some(endpoint) = &self.endpoint {
            file.endpoint = Some(endpoint.clone());
        }
        if self.no_keepalive {
            file.keepalive_secs = None;
        } else if let Some(secs) = self.keepalive_secs {
            file.keepalive_secs = Some(secs);
        } else if file.keepalive_secs.is_none() {
            file.keepalive_secs = Some(RECOMMENDED_KEEPALIVE_INTERVAL.as_secs());
        }

        if let Some(token) = &self.session_token {
            file.session_token = Some(token.clone());
            file.api_key = None;
        } else if let Some(key) = &self.api_key {
            file.api_key = Some(key.clone());
            file.session_token = None;
        } else if file.api_key.is_none() && file.session_token.is_none() {
            file.api_key = std::env::var("VOX8_API_KEY").ok();
        }

        Ok(file.into_builder()?.build()?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vox8=info")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    let config = cli.client_config()?;
    let chunk_bytes = cli.chunk_bytes.max(2);

    let translated_audio = Arc::new(Mutex::new(Vec::<u8>::new()));
    let sink = Arc::clone(&translated_audio);

    let client = Vox8Client::builder(config)
        .on_transcript(|t| {
            match (&t.translation, t.is_final) {
                (Some(translation), true) => println!("{} => {}", t.text, translation),
                (None, true) => println!("{}", t.text),
                (_, false) => eprintln!("… {}", t.text),
            }
            Ok(())
        })
        .on_audio(move |chunk| {
            sink.lock().extend_from_slice(&chunk.decode_audio()?);
            Ok(())
        })
        .on_error(|err| {
            eprintln!("error: {err}");
            Ok(())
        })
        .build();

    client.connect().await.context("failed to start vox8 session")?;
    tracing::info!(session_id = ?client.session_id(), "Streaming");

    let listener = client.clone();
    let receive = tokio::spawn(async move { listener.listen().await });

    let mut input: Box<dyn tokio::io::AsyncRead + Unpin + Send> = if cli.input.as_os_str() == "-" {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(
            tokio::fs::File::open(&cli.input)
                .await
                .with_context(|| format!("failed to open {}", cli.input.display()))?,
        )
    };

    let pace = Duration::from_micros(chunk_bytes as u64 * 1_000_000 / BYTES_PER_SECOND);
    let mut buf = vec![0u8; chunk_bytes];
    let mut total = 0usize;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted");
                break;
            }
            read = input.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to read audio input");
                        break;
                    }
                };
                if let Err(e) = client.send_pcm(&buf[..n]).await {
                    if e.is_terminal() {
                        tracing::error!(error = %e, "Session lost, stopping");
                        break;
                    }
                    tracing::warn!(error = %e, "Dropped audio chunk");
                    continue;
                }
                total += n;
                if !cli.no_pacing {
                    tokio::time::sleep(pace).await;
                }
            }
        }
    }
    tracing::info!(bytes = total, "Audio sent");

    if client.is_connected() {
        tokio::time::sleep(Duration::from_secs(cli.linger_secs)).await;
    }
    if let Err(e) = client.disconnect().await {
        tracing::warn!(error = %e, "Disconnect did not complete cleanly");
    }
    client.cancel_listen();
    if let Ok(Err(e)) = receive.await {
        tracing::warn!(error = %e, "Receive loop ended with an error");
    }

    if let Some(path) = &cli.output {
        let audio = std::mem::take(&mut *translated_audio.lock());
        tokio::fs::write(path, &audio)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!(bytes = audio.len(), path = %path.display(), "Translated audio written");
    }

    Ok(())
}
