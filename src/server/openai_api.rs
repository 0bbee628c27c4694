//! OpenAI-compatible HTTP API.
//!
//! Implements the subset of the OpenAI API the chat backend exposes:
//! - POST /v1/chat/completions
//! - POST /v1/completions
//! - GET /v1/models
//! - GET /health
//!
//! plus the audio job surface (POST /runsync) and GET /metrics.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::inference::engine::{ChatMessage, EngineError, OutputStream, RequestOutput, TextEngine};
use crate::inference::request_id::RequestId;
use crate::inference::sampling::{SamplingOptions, SamplingParameters};
use crate::job::{JobRequestHandler, JobResult};
use crate::metrics::Metrics;
use crate::server::error::ApiError;
use crate::server::streaming::{delta_stream, StreamContext, StreamFrame, StreamKind};

/// Application state shared across handlers.
pub struct AppState {
    pub engine: Arc<dyn TextEngine>,
    pub jobs: JobRequestHandler,
    pub config: Arc<Config>,
    pub metrics: Metrics,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let in_flight = Arc::new(Semaphore::new(
        state
            .config
            .server
            .max_concurrent_requests
            .clamp(1, Semaphore::MAX_PERMITS),
    ));

    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
        .route("/runsync", post(run_job))
        .route("/metrics", get(render_metrics))
        .layer(middleware::from_fn_with_state(in_flight, hold_permit))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Admit a request only while fewer than `max_concurrent_requests` are in
/// flight. A streamed response keeps its permit until the body ends or the
/// client goes away.
async fn hold_permit(
    State(in_flight): State<Arc<Semaphore>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let permit = in_flight
        .acquire_owned()
        .await
        .map_err(|_| ApiError::internal("request limiter closed"))?;

    let response = next.run(request).await;
    let streaming = response
        .headers()
        .get(header::CONTENT_TYPE)
        .is_some_and(|v| v.as_bytes().starts_with(b"text/event-stream"));
    if !streaming {
        return Ok(response);
    }

    let (parts, body) = response.into_parts();
    let body = body.into_data_stream().map(move |chunk| {
        let _permit = &permit;
        chunk
    });
    Ok(Response::from_parts(parts, Body::from_stream(body)))
}

// ─── Request/Response Types ────────────────────────────────────────────────

/// Chat completion request (OpenAI-compatible).
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    /// Accepted for compatibility; the served model is fixed.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub sampling: SamplingOptions,
}

/// Completion request (non-chat).
#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub sampling: SamplingOptions,
}

/// Chat completion response (non-streaming).
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: usize,
    pub message: ChatMessage,
    pub finish_reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: usize,
    pub text: String,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn from_output(output: &RequestOutput) -> Self {
        let prompt_tokens = output.prompt_tokens();
        let completion_tokens = output.completion_tokens();
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Model listing response.
#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub owned_by: String,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub model: String,
    pub engine: String,
    pub max_model_len: usize,
    pub gpu: String,
}

/// Job-queue envelope: `{"id"?, "input": {...}}`.
#[derive(Debug, Deserialize)]
pub struct JobEnvelope {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: String,
    pub status: &'static str,
    pub output: JobResult,
}

// ─── Generation helpers ────────────────────────────────────────────────────

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Drain the engine stream, keeping only the last partial output.
pub async fn collect_final(mut outputs: OutputStream) -> Result<RequestOutput, EngineError> {
    let mut last = None;
    while let Some(item) = outputs.recv().await {
        last = Some(item?);
    }
    last.ok_or(EngineError::NoOutput)
}

async fn generate_buffered(
    state: &AppState,
    prompt: String,
    params: SamplingParameters,
    request_id: &RequestId,
) -> Result<RequestOutput, ApiError> {
    let outputs = state
        .engine
        .generate(prompt, params, request_id.clone())
        .await?;

    let limit = Duration::from_secs(state.config.server.request_timeout_secs);
    match tokio::time::timeout(limit, collect_final(outputs)).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            warn!(request_id = %request_id, "Generation timed out");
            Err(ApiError::timeout("generation timed out"))
        }
    }
}

async fn stream_response(
    state: &Arc<AppState>,
    prompt: String,
    params: SamplingParameters,
    ctx: StreamContext,
) -> Result<Response, ApiError> {
    let outputs = state
        .engine
        .generate(prompt, params, ctx.id.clone())
        .await?;

    let counters = state.clone();
    let events = delta_stream(outputs, ctx).map(move |frame| {
        if matches!(frame, StreamFrame::Delta(_)) {
            counters.metrics.stream_chunks.inc();
        }
        Ok::<_, Infallible>(Event::default().data(frame.data()))
    });

    Ok(Sse::new(events).into_response())
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    state.metrics.request("chat_completions");
    let Json(req) = body?;

    if req.messages.is_empty() {
        return Err(ApiError::bad_request("messages is required"));
    }
    let params = SamplingParameters::try_from(req.sampling)?
        .within_context(state.config.model.max_model_len)?;
    let request_id = RequestId::chat();

    info!(
        request_id = %request_id,
        messages = req.messages.len(),
        stream = req.stream,
        max_tokens = params.max_tokens,
        "Chat completion request"
    );

    let prompt = state.engine.apply_chat_template(&req.messages).await?;
    let model = state.config.model.model_id.clone();

    if req.stream {
        let ctx = StreamContext {
            id: request_id,
            model,
            created: now_unix_secs(),
            kind: StreamKind::Chat,
        };
        return stream_response(&state, prompt, params, ctx).await;
    }

    let output = generate_buffered(&state, prompt, params, &request_id).await?;
    let response = ChatCompletionResponse {
        id: request_id.to_string(),
        object: "chat.completion".to_string(),
        created: now_unix_secs(),
        model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: output.text().unwrap_or_default().to_string(),
            },
            finish_reason: "stop".to_string(),
        }],
        usage: Usage::from_output(&output),
    };

    Ok(Json(response).into_response())
}

async fn completions(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    state.metrics.request("completions");
    let Json(req) = body?;

    if req.prompt.is_empty() {
        return Err(ApiError::bad_request("prompt is required"));
    }
    let params = SamplingParameters::try_from(req.sampling)?
        .within_context(state.config.model.max_model_len)?;
    let request_id = RequestId::completion();

    info!(
        request_id = %request_id,
        prompt_chars = req.prompt.chars().count(),
        stream = req.stream,
        max_tokens = params.max_tokens,
        "Completion request"
    );

    let model = state.config.model.model_id.clone();

    if req.stream {
        let ctx = StreamContext {
            id: request_id,
            model,
            created: now_unix_secs(),
            kind: StreamKind::Completion,
        };
        return stream_response(&state, req.prompt, params, ctx).await;
    }

    let output = generate_buffered(&state, req.prompt, params, &request_id).await?;
    let response = CompletionResponse {
        id: request_id.to_string(),
        object: "text_completion".to_string(),
        created: now_unix_secs(),
        model,
        choices: vec![CompletionChoice {
            index: 0,
            text: output.text().unwrap_or_default().to_string(),
            finish_reason: "stop".to_string(),
        }],
        usage: Usage::from_output(&output),
    };

    Ok(Json(response).into_response())
}

async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    state.metrics.request("models");
    Json(ModelList {
        object: "list".to_string(),
        data: vec![ModelInfo {
            id: state.config.model.model_id.clone(),
            object: "model".to_string(),
            owned_by: state.config.model.owned_by.clone(),
        }],
    })
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let model = &state.config.model;
    Json(HealthResponse {
        status: "ok".to_string(),
        model: model.model_id.clone(),
        engine: model.engine.clone(),
        max_model_len: model.max_model_len,
        gpu: model.gpu.clone(),
    })
}

async fn run_job(
    State(state): State<Arc<AppState>>,
    body: Result<Json<JobEnvelope>, JsonRejection>,
) -> Result<Json<JobResponse>, ApiError> {
    state.metrics.request("runsync");
    let Json(envelope) = body?;
    let id = envelope
        .id
        .unwrap_or_else(|| format!("job-{}", Uuid::new_v4().simple()));

    let output = state.jobs.handle(&envelope.input).await;
    state.metrics.jobs.with_label_values(&[output.outcome()]).inc();

    let status = match output {
        JobResult::Failure { .. } => "FAILED",
        _ => "COMPLETED",
    };
    Ok(Json(JobResponse { id, status, output }))
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => ApiError::internal(e.to_string()).into_response(),
    }
}
