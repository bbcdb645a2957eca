//! Plain WAV helpers for fixtures and synthetic voices.
//!
//! Analysis requests go through the symphonia-based loader; these helpers exist for the
//! places that want raw samples without the preprocessing pipeline (the CLI `synth`
//! subcommand, tests, and the raw-array analysis path).

use std::io::{Read, Seek};
use std::path::Path;

use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

/// Read a WAV stream into mono `f32` samples in `[-1.0, 1.0]`, plus its sample rate.
///
/// Multi-channel input is averaged into one channel. Integer PCM of any width and 32-bit
/// float are accepted.
pub fn read_wav<R>(reader: R) -> Result<(Vec<f32>, u32)>
where
    R: Read + Seek,
{
    let mut reader = WavReader::new(reader).context("failed to read WAV data from reader")?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .context("corrupt WAV samples")?,
        SampleFormat::Int => {
            let scale = 1.0 / (1_i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<_, _>>()
                .context("corrupt WAV samples")?
        }
    };

    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

/// Write mono samples as 16-bit PCM. Values outside `[-1.0, 1.0]` are clipped.
pub fn write_wav(path: impl AsRef<Path>, samples: &[f32], sample_rate: u32) -> Result<()> {
    let path = path.as_ref();
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("failed to create '{}'", path.display()))?;
    for s in samples {
        writer.write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16)?;
    }
    writer.finalize().context("failed to finalize WAV")?;
    Ok(())
}
