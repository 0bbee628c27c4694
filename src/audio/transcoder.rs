//! Conversion of raw samples into the container the client asked for.
//!
//! The samples are always written to a WAV file first. Compressed targets are
//! then produced by an external encoder running under a timeout. Every file
//! lives in a per-call scratch directory that is removed when the call returns,
//! whichever way it returns.

use std::fmt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::audio::wav::write_wav;
use crate::config::TranscoderConfig;

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV encoding failed: {0}")]
    Wav(#[from] hound::Error),

    #[error("Encoder did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Encoder exited with {status}: {stderr}")]
    EncoderFailed { status: ExitStatus, stderr: String },

    #[error("WAV writer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Output container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    #[default]
    Mp3,
    Ogg,
}

impl AudioFormat {
    /// Parse a client-supplied format. Anything unrecognised degrades to WAV.
    pub fn parse_or_wav(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mp3" => AudioFormat::Mp3,
            "ogg" => AudioFormat::Ogg,
            _ => AudioFormat::Wav,
        }
    }

    /// Whether producing this format needs the external encoder.
    pub fn is_compressed(self) -> bool {
        !matches!(self, AudioFormat::Wav)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Ogg => "ogg",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoded audio and the format it actually ended up in.
#[derive(Debug, Clone)]
pub struct Transcoded {
    pub bytes: Vec<u8>,
    pub format: AudioFormat,
}

/// Runs the WAV baseline and the external encoder.
#[derive(Debug, Clone)]
pub struct MediaTranscoder {
    config: TranscoderConfig,
}

impl MediaTranscoder {
    pub fn new(config: TranscoderConfig) -> Self {
        Self { config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.config.timeout_secs.max(0.0))
    }

    fn scratch_dir(&self) -> std::io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("gen-serve-");
        match &self.config.scratch_dir {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
    }

    /// Encode mono samples into `target`.
    pub async fn transcode(
        &self,
        samples: Vec<f32>,
        sample_rate: u32,
        target: AudioFormat,
    ) -> Result<Transcoded, TranscodeError> {
        let scratch = self.scratch_dir()?;
        let wav_path = scratch.path().join("source.wav");

        let path = wav_path.clone();
        tokio::task::spawn_blocking(move || write_wav(&samples, &path, sample_rate)).await??;

        let transcoded = if target.is_compressed() {
            let out_path = scratch.path().join(format!("encoded.{}", target.as_str()));
            self.run_encoder(&wav_path, &out_path).await?;
            Transcoded {
                bytes: tokio::fs::read(&out_path).await?,
                format: target,
            }
        } else {
            Transcoded {
                bytes: tokio::fs::read(&wav_path).await?,
                format: AudioFormat::Wav,
            }
        };

        scratch.close()?;
        debug!(
            format = %transcoded.format,
            bytes = transcoded.bytes.len(),
            "Transcode complete"
        );
        Ok(transcoded)
    }

    async fn run_encoder(&self, input: &Path, output: &Path) -> Result<(), TranscodeError> {
        let mut child = Command::new(&self.config.ffmpeg_path)
            .arg("-y")
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(input)
            .arg("-b:a")
            .arg(&self.config.bitrate)
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stderr_pipe = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let limit = self.timeout();
        let status = match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(timeout = ?limit, "Encoder timed out, killing it");
                let _ = child.kill().await;
                stderr_task.abort();
                return Err(TranscodeError::Timeout(limit));
            }
        };

        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(TranscodeError::EncoderFailed {
                status,
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}
