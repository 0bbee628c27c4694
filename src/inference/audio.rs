//! Audio synthesis engine contract.
//!
//! The audio engine is blocking: one call produces the whole clip. It is
//! expensive to construct, so it sits behind [`LazyAudioEngine`], which loads
//! it on first use and then keeps it for the life of the process. There is no
//! teardown path.

use std::f32::consts::PI;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::inference::engine::EngineError;

/// Diffusion steps. Fixed, not client-configurable.
pub const INFER_STEPS: u32 = 60;
pub const GUIDANCE_SCALE: f32 = 15.0;
pub const SCHEDULER: &str = "euler";
pub const CFG_TYPE: &str = "apg";
pub const OMEGA: f32 = 10.0;

/// Lyrics sent to the engine for instrumental tracks.
pub const INSTRUMENTAL_MARKER: &str = "[instrumental]";

/// Parameters for one synthesis call.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioParams {
    pub prompt: String,
    pub lyrics: String,
    pub duration: f64,
    pub infer_steps: u32,
    pub guidance_scale: f32,
    pub scheduler: &'static str,
    pub cfg_type: &'static str,
    pub omega: f32,
}

impl AudioParams {
    /// Client-controlled fields plus the fixed inference configuration.
    pub fn new(prompt: impl Into<String>, lyrics: impl Into<String>, duration: f64) -> Self {
        Self {
            prompt: prompt.into(),
            lyrics: lyrics.into(),
            duration,
            infer_steps: INFER_STEPS,
            guidance_scale: GUIDANCE_SCALE,
            scheduler: SCHEDULER,
            cfg_type: CFG_TYPE,
            omega: OMEGA,
        }
    }
}

/// Raw engine samples.
#[derive(Debug, Clone, PartialEq)]
pub enum Samples {
    Mono(Vec<f32>),
    /// One vector per channel.
    Multi(Vec<Vec<f32>>),
}

impl Samples {
    /// The single channel used for output: the first one when there are several.
    pub fn into_first_channel(self) -> Vec<f32> {
        match self {
            Samples::Mono(s) => s,
            Samples::Multi(channels) => channels.into_iter().next().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioOutput {
    pub samples: Samples,
    pub sample_rate: u32,
}

/// Blocking audio synthesis. Called from the blocking thread pool.
pub trait AudioEngine: Send + Sync {
    fn invoke(&self, params: &AudioParams) -> Result<AudioOutput, EngineError>;
}

/// Constructs the audio engine. May be slow.
pub trait AudioEngineLoader: Send + Sync {
    fn load(&self) -> Result<Arc<dyn AudioEngine>, EngineError>;
}

impl<F> AudioEngineLoader for F
where
    F: Fn() -> Result<Arc<dyn AudioEngine>, EngineError> + Send + Sync,
{
    fn load(&self) -> Result<Arc<dyn AudioEngine>, EngineError> {
        self()
    }
}

/// Process-wide audio engine handle, initialized at most once.
///
/// A failed load is not memoized: the next caller tries again.
pub struct LazyAudioEngine {
    loader: Arc<dyn AudioEngineLoader>,
    cell: OnceCell<Arc<dyn AudioEngine>>,
}

impl LazyAudioEngine {
    pub fn new(loader: Arc<dyn AudioEngineLoader>) -> Self {
        Self {
            loader,
            cell: OnceCell::new(),
        }
    }

    /// Wrap an already constructed engine.
    pub fn ready(engine: Arc<dyn AudioEngine>) -> Self {
        let preloaded = engine.clone();
        Self {
            loader: Arc::new(move || -> Result<Arc<dyn AudioEngine>, EngineError> {
                Ok(preloaded.clone())
            }),
            cell: OnceCell::new_with(Some(engine)),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    /// The engine, loading it on first use.
    pub async fn get(&self) -> Result<Arc<dyn AudioEngine>, EngineError> {
        self.cell
            .get_or_try_init(|| async {
                info!("Loading audio engine");
                let loader = self.loader.clone();
                let engine = tokio::task::spawn_blocking(move || loader.load())
                    .await
                    .map_err(|e| EngineError::LoadFailed(format!("loader panicked: {e}")))?
                    .inspect_err(|e| warn!("Audio engine load failed: {e}"))?;
                info!("Audio engine ready");
                Ok::<_, EngineError>(engine)
            })
            .await
            .cloned()
    }
}

/// Stub engine that renders a stereo sine tone of the requested length.
pub struct ToneEngine {
    pub sample_rate: u32,
    pub frequency: f32,
}

impl Default for ToneEngine {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            frequency: 440.0,
        }
    }
}

impl AudioEngine for ToneEngine {
    fn invoke(&self, params: &AudioParams) -> Result<AudioOutput, EngineError> {
        if !params.duration.is_finite() || params.duration <= 0.0 {
            return Err(EngineError::Generation(format!(
                "invalid duration {}",
                params.duration
            )));
        }

        let frames = (params.duration * self.sample_rate as f64) as usize;
        let step = 2.0 * PI * self.frequency / self.sample_rate as f32;
        let left: Vec<f32> = (0..frames).map(|i| 0.2 * (step * i as f32).sin()).collect();
        let right = left.clone();

        Ok(AudioOutput {
            samples: Samples::Multi(vec![left, right]),
            sample_rate: self.sample_rate,
        })
    }
}
