//! Audio ingestion: decode (any symphonia-supported container), downmix, resample, then hand
//! the mono target-rate samples to [`preprocess`].
//!
//! Decoding stops as soon as the analysis cap (`max_duration_seconds`) worth of audio has
//! been produced, so a long upload costs no more than a short one.

use std::io::Read;
use std::path::Path;

use tracing::debug;

use crate::audio_pipeline::TARGET_SAMPLE_RATE;
use crate::decoder::{
    SamplesSink, SourceInfo, StreamDecodeOpts, decode_to_stream_from_bytes,
    decode_to_stream_from_file, decode_to_stream_from_read,
};
use crate::input::check_source_duration;
use crate::opts::Opts;
use crate::waveform::{Waveform, max_duration_samples, preprocess};
use crate::{Error, Result};

/// Collects decoded samples up to a cap, then asks the decoder to stop.
struct CappedCollector {
    samples: Vec<f32>,
    limit: usize,
    truncated: bool,
}

impl CappedCollector {
    fn new(limit: usize) -> Self {
        Self {
            samples: Vec::new(),
            limit,
            truncated: false,
        }
    }
}

impl SamplesSink for CappedCollector {
    fn on_samples(&mut self, samples: &[f32]) -> anyhow::Result<bool> {
        let room = self.limit.saturating_sub(self.samples.len());
        if samples.len() > room {
            self.truncated = true;
        }
        self.samples.extend_from_slice(&samples[..samples.len().min(room)]);
        Ok(self.samples.len() < self.limit)
    }
}

fn collector(opts: &Opts) -> CappedCollector {
    let cap = max_duration_samples(opts);
    CappedCollector::new(if cap == 0 { usize::MAX } else { cap })
}

fn finish(collected: CappedCollector, info: SourceInfo, opts: &Opts) -> Result<Waveform> {
    if let Some(frames) = info.declared_frames {
        check_source_duration(frames, info.sample_rate, opts)?;
    }
    debug!(
        source_rate = info.sample_rate,
        decoded = collected.samples.len(),
        truncated = collected.truncated,
        "decoded audio"
    );
    preprocess(collected.samples, TARGET_SAMPLE_RATE, opts)
}

fn decode_opts(hint: Option<&str>) -> StreamDecodeOpts {
    StreamDecodeOpts {
        hint_extension: hint.map(str::to_ascii_lowercase),
        ..StreamDecodeOpts::default()
    }
}

/// Decode and preprocess an audio file.
pub fn load_file(path: impl AsRef<Path>, opts: &Opts) -> Result<Waveform> {
    let path = path.as_ref();
    let mut sink = collector(opts);
    let info = decode_to_stream_from_file(path, StreamDecodeOpts::default(), &mut sink)
        .map_err(|e| Error::load(format!("{e:#}")))?;
    finish(sink, info, opts)
}

/// Decode and preprocess an unseekable stream. `hint` is a container extension such as `"mp3"`.
pub fn load_reader<R>(reader: R, hint: Option<&str>, opts: &Opts) -> Result<Waveform>
where
    R: Read + Send + 'static,
{
    let mut sink = collector(opts);
    let info = decode_to_stream_from_read(reader, decode_opts(hint), &mut sink)
        .map_err(|e| Error::load(format!("{e:#}")))?;
    finish(sink, info, opts)
}

/// Decode and preprocess an encoded payload held in memory.
pub fn load_bytes(bytes: Vec<u8>, hint: Option<&str>, opts: &Opts) -> Result<Waveform> {
    let mut sink = collector(opts);
    let info = decode_to_stream_from_bytes(bytes, decode_opts(hint), &mut sink)
        .map_err(|e| Error::load(format!("{e:#}")))?;
    finish(sink, info, opts)
}

/// Preprocess raw mono samples recorded at `sample_rate`.
pub fn load_samples(mut samples: Vec<f32>, sample_rate: u32, opts: &Opts) -> Result<Waveform> {
    if sample_rate == 0 {
        return Err(Error::preprocess("sample rate must be non-zero"));
    }
    check_source_duration(samples.len() as u64, sample_rate, opts)?;

    if opts.max_duration_seconds > 0.0 {
        let cap = (opts.max_duration_seconds as f64 * sample_rate as f64).floor() as usize;
        samples.truncate(cap.max(1));
    }
    preprocess(samples, sample_rate, opts)
}
