//! Audio output handling.
//!
//! - [`wav`]: Uncompressed WAV writing (the baseline container)
//! - [`transcoder`]: Conversion to compressed formats through an external encoder

pub mod transcoder;
pub mod wav;

pub use transcoder::{AudioFormat, MediaTranscoder, TranscodeError, Transcoded};
