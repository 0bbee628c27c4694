//! External generation engines and the parameters used to drive them.
//!
//! - [`engine`]: Incremental text generation contract (`TextEngine`)
//! - [`audio`]: Blocking audio synthesis contract and its lazily loaded handle
//! - [`sampling`]: Sampling parameters derived from client requests
//! - [`request_id`]: Per-request correlation tokens

pub mod audio;
pub mod engine;
pub mod request_id;
pub mod sampling;
