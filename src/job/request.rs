//! Job input.
//!
//! Inputs arrive as loosely shaped JSON objects. They are parsed in two passes:
//! the prompt alone first, so a missing prompt or the ping sentinel is decided
//! before any other field is looked at, then the full typed input.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::audio::AudioFormat;
use crate::inference::audio::{AudioParams, INSTRUMENTAL_MARKER};

/// Prompt value that answers a liveness probe without touching the engine.
pub const PING_PROMPT: &str = "__ping__";

pub const MIN_DURATION: f64 = 5.0;
pub const MAX_DURATION: f64 = 240.0;
pub const DEFAULT_DURATION: f64 = 30.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    #[error("prompt is required")]
    MissingPrompt,

    #[error("duration must be a finite number, got {0:?}")]
    InvalidDuration(String),

    #[error("invalid job input: {0}")]
    Malformed(String),
}

/// Clamp a requested duration (seconds) into the supported range.
pub fn clamp_duration(seconds: f64) -> f64 {
    seconds.clamp(MIN_DURATION, MAX_DURATION)
}

#[derive(Deserialize)]
struct PromptField {
    #[serde(default)]
    prompt: Option<String>,
}

/// Duration may be sent as a number or a numeric string.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Number(f64),
    Text(String),
}

#[derive(Deserialize)]
struct RawJobInput {
    #[serde(default)]
    lyrics: Option<String>,
    #[serde(default)]
    duration: Option<RawDuration>,
    #[serde(default)]
    instrumental: Option<bool>,
    #[serde(default)]
    format: Option<String>,
}

/// A validated, normalized generation job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub prompt: String,
    pub lyrics: String,
    /// Always within [`MIN_DURATION`, `MAX_DURATION`].
    pub duration: f64,
    pub instrumental: bool,
    pub format: AudioFormat,
}

impl JobRequest {
    /// Lyrics actually sent to the engine.
    pub fn effective_lyrics(&self) -> &str {
        if self.instrumental {
            INSTRUMENTAL_MARKER
        } else {
            &self.lyrics
        }
    }

    pub fn audio_params(&self) -> AudioParams {
        AudioParams::new(self.prompt.clone(), self.effective_lyrics(), self.duration)
    }
}

/// What a job asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum JobInput {
    Ping,
    Generate(JobRequest),
}

impl JobInput {
    pub fn parse(input: &Value) -> Result<Self, JobError> {
        let prompt = serde_json::from_value::<PromptField>(input.clone())
            .ok()
            .and_then(|p| p.prompt)
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .ok_or(JobError::MissingPrompt)?;

        if prompt == PING_PROMPT {
            return Ok(JobInput::Ping);
        }

        let raw: RawJobInput = serde_json::from_value(input.clone())
            .map_err(|e| JobError::Malformed(e.to_string()))?;

        let duration = match raw.duration {
            None => DEFAULT_DURATION,
            Some(RawDuration::Number(n)) => n,
            Some(RawDuration::Text(s)) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| JobError::InvalidDuration(s.clone()))?,
        };
        if duration.is_nan() {
            return Err(JobError::InvalidDuration(duration.to_string()));
        }

        Ok(JobInput::Generate(JobRequest {
            prompt,
            lyrics: raw.lyrics.unwrap_or_default(),
            duration: clamp_duration(duration),
            instrumental: raw.instrumental.unwrap_or(true),
            format: raw
                .format
                .as_deref()
                .map(AudioFormat::parse_or_wav)
                .unwrap_or_default(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn generate(input: Value) -> JobRequest {
        match JobInput::parse(&input).unwrap() {
            JobInput::Generate(req) => req,
            JobInput::Ping => panic!("unexpected ping"),
        }
    }

    #[test]
    fn test_clamp_duration() {
        assert_eq!(clamp_duration(300.0), 240.0);
        assert_eq!(clamp_duration(1.0), 5.0);
        assert_eq!(clamp_duration(30.0), 30.0);
        assert_eq!(clamp_duration(f64::INFINITY), 240.0);
        assert_eq!(clamp_duration(-10.0), 5.0);
    }

    #[test]
    fn test_missing_or_blank_prompt() {
        for input in [json!({}), json!({"prompt": ""}), json!({"prompt": "  \n\t"}), json!(null)] {
            assert_eq!(JobInput::parse(&input), Err(JobError::MissingPrompt));
        }
    }

    #[test]
    fn test_ping_decided_before_other_fields() {
        let input = json!({"prompt": " __ping__ ", "duration": "not a number"});
        assert_eq!(JobInput::parse(&input), Ok(JobInput::Ping));
    }

    #[test]
    fn test_defaults() {
        let req = generate(json!({"prompt": "lofi beat"}));
        assert_eq!(req.duration, 30.0);
        assert!(req.instrumental);
        assert_eq!(req.format, AudioFormat::Mp3);
        assert_eq!(req.effective_lyrics(), "[instrumental]");
    }

    #[test]
    fn test_instrumental_overrides_lyrics() {
        let req = generate(json!({"prompt": "p", "lyrics": "la la", "instrumental": true}));
        assert_eq!(req.audio_params().lyrics, "[instrumental]");

        let req = generate(json!({"prompt": "p", "lyrics": "la la", "instrumental": false}));
        assert_eq!(req.audio_params().lyrics, "la la");
    }

    #[test]
    fn test_duration_string_and_clamp() {
        assert_eq!(generate(json!({"prompt": "p", "duration": "300"})).duration, 240.0);
        assert_eq!(generate(json!({"prompt": "p", "duration": 1})).duration, 5.0);
        assert_eq!(generate(json!({"prompt": "p", "duration": 42.5})).duration, 42.5);
    }

    #[test]
    fn test_bad_duration_rejected() {
        let err = JobInput::parse(&json!({"prompt": "p", "duration": "long"})).unwrap_err();
        assert_eq!(err, JobError::InvalidDuration("long".into()));
    }

    #[test]
    fn test_unknown_format_degrades_to_wav() {
        assert_eq!(generate(json!({"prompt": "p", "format": "flac"})).format, AudioFormat::Wav);
        assert_eq!(generate(json!({"prompt": "p", "format": "ogg"})).format, AudioFormat::Ogg);
    }
}
