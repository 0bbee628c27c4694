//! HTTP server providing an OpenAI-compatible API.
//!
//! - [`openai_api`]: Request/response types and route handlers
//! - [`streaming`]: Delta computation and SSE frames
//! - [`error`]: API error responses

pub mod error;
pub mod openai_api;
pub mod streaming;
