//! WAV writer for engine output.
//!
//! Writes mono 16-bit PCM using the hound crate. Samples are expected in
//! [-1.0, 1.0] and are clamped before quantization.

use std::io::{Seek, Write};
use std::path::Path;

use hound::{SampleFormat, WavSpec, WavWriter};

/// Mono output.
pub const CHANNELS: u16 = 1;

pub const BITS_PER_SAMPLE: u16 = 16;

fn spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: CHANNELS,
        sample_rate,
        bits_per_sample: BITS_PER_SAMPLE,
        sample_format: SampleFormat::Int,
    }
}

fn write_samples<W: Write + Seek>(
    mut writer: WavWriter<W>,
    samples: &[f32],
) -> Result<(), hound::Error> {
    for sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer.write_sample(value)?;
    }
    writer.finalize()
}

/// Write samples to a WAV file at `path`.
pub fn write_wav(samples: &[f32], path: &Path, sample_rate: u32) -> Result<(), hound::Error> {
    let writer = WavWriter::create(path, spec(sample_rate))?;
    write_samples(writer, samples)
}
