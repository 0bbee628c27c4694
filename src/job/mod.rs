//! One-shot audio generation jobs.
//!
//! - [`request`]: Job input parsing, validation and normalization
//! - [`handler`]: Drives the audio engine and the transcoder for one job

pub mod handler;
pub mod request;

pub use handler::{JobRequestHandler, JobResult};
pub use request::{JobError, JobInput, JobRequest};
