//! Sampling parameters.
//!
//! Client requests carry optional sampling knobs; [`SamplingParameters`] is the
//! fully defaulted, validated form handed to the text engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_P: f64 = 0.9;
pub const DEFAULT_MAX_TOKENS: usize = 1024;
pub const DEFAULT_REPETITION_PENALTY: f64 = 1.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SamplingError {
    #[error("temperature must be >= 0, got {0}")]
    Temperature(f64),

    #[error("top_p must be in (0, 1], got {0}")]
    TopP(f64),

    #[error("max_tokens must be >= 1")]
    MaxTokens,

    #[error("max_tokens must be <= {limit} (the model context length), got {requested}")]
    MaxTokensTooLarge { requested: usize, limit: usize },

    #[error("repetition_penalty must be > 0, got {0}")]
    RepetitionPenalty(f64),

    #[error("{name} must be in [-2, 2], got {value}")]
    Penalty { name: &'static str, value: f64 },
}

/// `stop` may be a single string or a list of strings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

impl StopSequences {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StopSequences::One(s) => vec![s],
            StopSequences::Many(v) => v,
        }
    }
}

/// Sampling knobs exactly as the client sent them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SamplingOptions {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub stop: Option<StopSequences>,
    #[serde(default)]
    pub repetition_penalty: Option<f64>,
    #[serde(default)]
    pub presence_penalty: Option<f64>,
    #[serde(default)]
    pub frequency_penalty: Option<f64>,
}

/// Validated sampling parameters for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplingParameters {
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: usize,
    pub stop: Vec<String>,
    pub repetition_penalty: f64,
    pub presence_penalty: f64,
    pub frequency_penalty: f64,
}

impl Default for SamplingParameters {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            max_tokens: DEFAULT_MAX_TOKENS,
            stop: Vec::new(),
            repetition_penalty: DEFAULT_REPETITION_PENALTY,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
        }
    }
}

impl TryFrom<SamplingOptions> for SamplingParameters {
    type Error = SamplingError;

    /// Apply defaults, then check ranges in field order. The first violation wins.
    fn try_from(opts: SamplingOptions) -> Result<Self, Self::Error> {
        let defaults = SamplingParameters::default();
        let params = SamplingParameters {
            temperature: opts.temperature.unwrap_or(defaults.temperature),
            top_p: opts.top_p.unwrap_or(defaults.top_p),
            max_tokens: opts.max_tokens.unwrap_or(defaults.max_tokens),
            stop: opts.stop.map(StopSequences::into_vec).unwrap_or_default(),
            repetition_penalty: opts
                .repetition_penalty
                .unwrap_or(defaults.repetition_penalty),
            presence_penalty: opts.presence_penalty.unwrap_or(defaults.presence_penalty),
            frequency_penalty: opts.frequency_penalty.unwrap_or(defaults.frequency_penalty),
        };

        // NaN fails every comparison below, so it is rejected too.
        if !(params.temperature >= 0.0) {
            return Err(SamplingError::Temperature(params.temperature));
        }
        if !(params.top_p > 0.0 && params.top_p <= 1.0) {
            return Err(SamplingError::TopP(params.top_p));
        }
        if params.max_tokens == 0 {
            return Err(SamplingError::MaxTokens);
        }
        if !(params.repetition_penalty > 0.0) {
            return Err(SamplingError::RepetitionPenalty(params.repetition_penalty));
        }
        for (name, value) in [
            ("presence_penalty", params.presence_penalty),
            ("frequency_penalty", params.frequency_penalty),
        ] {
            if !(-2.0..=2.0).contains(&value) {
                return Err(SamplingError::Penalty { name, value });
            }
        }

        Ok(params)
    }
}

impl SamplingParameters {
    /// Reject generations that cannot fit in the model context.
    pub fn within_context(self, max_model_len: usize) -> Result<Self, SamplingError> {
        if self.max_tokens > max_model_len {
            return Err(SamplingError::MaxTokensTooLarge {
                requested: self.max_tokens,
                limit: max_model_len,
            });
        }
        Ok(self)
    }
}
