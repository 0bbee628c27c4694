//! Runtime configuration for gen-serve.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Every section has defaults, so a partial file (or none at all) is fine.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "gen-serve", about = "Audio job handler and OpenAI-compatible chat server")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the HTTP server (default).
    Serve,

    /// Run a single audio job and print its result as JSON.
    Job {
        /// JSON file holding the job input, or `-` for stdin.
        #[arg(short, long, default_value = "-")]
        input: PathBuf,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Advertised model metadata.
    pub model: ModelConfig,

    /// External encoder settings.
    pub transcoder: TranscoderConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// Maximum concurrently admitted requests.
    pub max_concurrent_requests: usize,

    /// Upper bound on a buffered generation, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            max_concurrent_requests: 64,
            request_timeout_secs: 600,
        }
    }
}

/// What `/v1/models` and `/health` report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model id echoed in responses.
    pub model_id: String,

    pub owned_by: String,

    /// Name of the backing generation engine.
    pub engine: String,

    /// Context window in tokens.
    pub max_model_len: usize,

    pub gpu: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: "nvidia/NVIDIA-Nemotron-Nano-9B-v2-Japanese".to_string(),
            owned_by: "nvidia".to_string(),
            engine: "vllm".to_string(),
            max_model_len: 32768,
            gpu: "A10G".to_string(),
        }
    }
}

/// External encoder (ffmpeg) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    /// Encoder executable.
    pub ffmpeg_path: PathBuf,

    /// Kill the encoder after this many seconds.
    pub timeout_secs: f64,

    /// Target bitrate for compressed formats.
    pub bitrate: String,

    /// Parent directory for scratch files (system temp dir when unset).
    pub scratch_dir: Option<PathBuf>,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            timeout_secs: 30.0,
            bitrate: "128k".to_string(),
            scratch_dir: None,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}
