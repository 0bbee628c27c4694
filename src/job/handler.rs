//! Audio job handler.
//!
//! `handle` never fails: every outcome, including engine and encoder errors,
//! is returned as a [`JobResult`].

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::audio::{AudioFormat, MediaTranscoder};
use crate::inference::audio::LazyAudioEngine;
use crate::job::request::{JobError, JobInput, JobRequest};

/// The single object returned for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobResult {
    Success {
        audio_base64: String,
        format: AudioFormat,
        duration: f64,
        sample_rate: u32,
    },
    Alive {
        status: String,
        message: String,
    },
    Failure {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        traceback: Option<String>,
    },
}

impl JobResult {
    pub fn alive() -> Self {
        JobResult::Alive {
            status: "ok".to_string(),
            message: "ace-step alive".to_string(),
        }
    }

    /// Input rejected before any engine work; no trace.
    pub fn rejected(err: &JobError) -> Self {
        JobResult::Failure {
            error: err.to_string(),
            traceback: None,
        }
    }

    /// Failure after work started; carries the full cause chain.
    pub fn failed(err: &anyhow::Error) -> Self {
        JobResult::Failure {
            error: format!("{err:#}"),
            traceback: Some(format!("{err:?}")),
        }
    }

    /// Metric label.
    pub fn outcome(&self) -> &'static str {
        match self {
            JobResult::Success { .. } => "success",
            JobResult::Alive { .. } => "ping",
            JobResult::Failure {
                traceback: None, ..
            } => "rejected",
            JobResult::Failure { .. } => "failed",
        }
    }
}

/// Runs audio jobs against the shared engine handle.
pub struct JobRequestHandler {
    engine: Arc<LazyAudioEngine>,
    transcoder: MediaTranscoder,
}

impl JobRequestHandler {
    pub fn new(engine: Arc<LazyAudioEngine>, transcoder: MediaTranscoder) -> Self {
        Self { engine, transcoder }
    }

    /// Process one job input.
    pub async fn handle(&self, input: &Value) -> JobResult {
        let request = match JobInput::parse(input) {
            Ok(JobInput::Ping) => return JobResult::alive(),
            Ok(JobInput::Generate(request)) => request,
            Err(err) => {
                info!(error = %err, "Job rejected");
                return JobResult::rejected(&err);
            }
        };

        let started = Instant::now();
        info!(
            duration = request.duration,
            instrumental = request.instrumental,
            format = %request.format,
            "Audio job started"
        );

        match self.run(request).await {
            Ok(result) => {
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "Audio job complete");
                result
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "Audio job failed");
                JobResult::failed(&err)
            }
        }
    }

    async fn run(&self, request: JobRequest) -> anyhow::Result<JobResult> {
        let engine = self.engine.get().await.context("loading audio engine")?;

        let params = request.audio_params();
        let output = tokio::task::spawn_blocking(move || engine.invoke(&params))
            .await
            .context("audio engine task panicked")?
            .context("audio generation failed")?;

        let sample_rate = output.sample_rate;
        let samples = output.samples.into_first_channel();

        let encoded = self
            .transcoder
            .transcode(samples, sample_rate, request.format)
            .await
            .with_context(|| format!("transcoding to {}", request.format))?;

        Ok(JobResult::Success {
            audio_base64: BASE64.encode(&encoded.bytes),
            format: encoded.format,
            duration: request.duration,
            sample_rate,
        })
    }
}
