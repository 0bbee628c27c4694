//! gen-serve binary.
//!
//! `serve` (the default) runs the HTTP API; `job` runs one audio job from a
//! JSON file and prints the result.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::info;

use gen_serve::audio::MediaTranscoder;
use gen_serve::config::{Cli, Command, Config};
use gen_serve::inference::audio::{AudioEngine, LazyAudioEngine, ToneEngine};
use gen_serve::inference::engine::{EngineError, StubTextEngine};
use gen_serve::job::JobRequestHandler;
use gen_serve::metrics::Metrics;
use gen_serve::server::openai_api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "gen_serve=debug,tower_http=debug"
    } else {
        "gen_serve=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("gen-serve v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen.clone() {
        config.server.listen = listen;
    }
    let config = Arc::new(config);

    info!(
        model = config.model.model_id,
        engine = config.model.engine,
        max_concurrent_requests = config.server.max_concurrent_requests,
        ffmpeg = %config.transcoder.ffmpeg_path.display(),
        "Configuration loaded"
    );

    // The audio engine is loaded on the first job, not at startup.
    let audio_engine = Arc::new(LazyAudioEngine::new(Arc::new(
        || -> Result<Arc<dyn AudioEngine>, EngineError> { Ok(Arc::new(ToneEngine::default())) },
    )));
    let jobs = JobRequestHandler::new(
        audio_engine,
        MediaTranscoder::new(config.transcoder.clone()),
    );

    match cli.command.unwrap_or(Command::Serve) {
        Command::Job { input } => run_job(&jobs, &input).await,
        Command::Serve => serve(config, jobs).await,
    }
}

async fn run_job(jobs: &JobRequestHandler, input: &Path) -> anyhow::Result<()> {
    let raw = if input == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(input).with_context(|| format!("reading {}", input.display()))?
    };

    let value: Value = serde_json::from_str(&raw).context("job input is not valid JSON")?;
    // Accept either the bare input or a `{"input": {...}}` envelope.
    let input = value.get("input").cloned().unwrap_or(value);

    let result = jobs.handle(&input).await;
    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

async fn serve(config: Arc<Config>, jobs: JobRequestHandler) -> anyhow::Result<()> {
    // Build application state.
    let state = Arc::new(AppState {
        engine: Arc::new(StubTextEngine::new()),
        jobs,
        config: config.clone(),
        metrics: Metrics::new()?,
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = &config.server.listen;
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
