//! gen-serve: request-normalization and streaming layer for generation backends.
//!
//! Fronts two external inference engines:
//!   - an audio synthesis engine, driven one job at a time (call-and-wait)
//!   - a token generation engine, consumed incrementally (partial outputs)
//!
//! and converts their output into a base64 job result or an
//! OpenAI-compatible JSON / SSE response.

pub mod audio;
pub mod config;
pub mod inference;
pub mod job;
pub mod metrics;
pub mod server;
