//! Decode media into mono `f32` at the canonical analysis rate, emitting fixed-size chunks
//! via a [`SamplesSink`].
//!
//! Container probing and codec work live in `media`; downmixing, resampling and chunking
//! live in [`crate::audio_pipeline`]. This module only wires the two together.
//!
//! Entry points:
//! - [`decode_to_stream_from_read`] for unseekable inputs (stdin, sockets)
//! - [`decode_to_stream_from_file`] for files; seeking lets the demuxer reach metadata at the
//!   end of the container (common for m4a/mp4 uploads)
//! - [`decode_to_stream_from_bytes`] for payloads already buffered in memory

use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use symphonia::core::io::{MediaSource, ReadOnlySource};

use crate::audio_pipeline::AudioPipeline;
use crate::media::{AudioTrack, Pull};

/// Consumer callback for decoded samples.
///
/// The sink receives **mono** `f32` samples at the canonical analysis rate.
/// Returning `Ok(false)` signals "stop decoding early".
pub trait SamplesSink {
    fn on_samples(&mut self, samples: &[f32]) -> Result<bool>;
}

/// Streaming decode configuration.
#[derive(Debug, Clone)]
pub struct StreamDecodeOpts {
    /// Chunk size *after* resampling (target-rate frames).
    pub target_chunk_frames: usize,

    /// Optional container hint (e.g. "wav", "mp3", "m4a", "ogg").
    /// This can improve probing, especially for unseekable streams.
    pub hint_extension: Option<String>,
}

impl Default for StreamDecodeOpts {
    fn default() -> Self {
        Self {
            target_chunk_frames: 4096,
            hint_extension: None,
        }
    }
}

/// Facts about the decoded source, reported once decoding finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceInfo {
    /// Sample rate of the selected track before resampling.
    pub sample_rate: u32,

    /// Frame count declared by the container, when known.
    pub declared_frames: Option<u64>,
}

/// Decode an unseekable input stream and emit normalized chunks into `sink`.
pub fn decode_to_stream_from_read<R>(
    reader: R,
    opts: StreamDecodeOpts,
    sink: &mut dyn SamplesSink,
) -> Result<SourceInfo>
where
    R: Read + Send + 'static,
{
    // Symphonia's `MediaSource` is `Read + Send + Sync`. We only need to *move* the reader into
    // the decode loop (not share it concurrently), so we wrap it in a mutex to satisfy `Sync`.
    let source = ReadOnlySource::new(LockedRead::new(reader));
    decode_impl(Box::new(source), opts, sink)
}

/// Decode a file from disk and emit normalized chunks into `sink`.
///
/// When `opts.hint_extension` is unset, the file extension is used as the probe hint.
pub fn decode_to_stream_from_file(
    path: &Path,
    mut opts: StreamDecodeOpts,
    sink: &mut dyn SamplesSink,
) -> Result<SourceInfo> {
    let file = File::open(path)
        .with_context(|| format!("failed to open audio file '{}'", path.display()))?;

    if opts.hint_extension.is_none() {
        opts.hint_extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
    }

    decode_impl(Box::new(file), opts, sink)
}

/// Decode an in-memory encoded payload (e.g. a request body that has already been hashed).
///
/// Unlike [`decode_to_stream_from_read`], the source is seekable, so containers that keep
/// their index at the end still probe correctly.
pub fn decode_to_stream_from_bytes(
    bytes: Vec<u8>,
    opts: StreamDecodeOpts,
    sink: &mut dyn SamplesSink,
) -> Result<SourceInfo> {
    decode_impl(Box::new(Cursor::new(bytes)), opts, sink)
}

/// Shared implementation that takes an abstract Symphonia `MediaSource`.
fn decode_impl(
    source: Box<dyn MediaSource>,
    opts: StreamDecodeOpts,
    sink: &mut dyn SamplesSink,
) -> Result<SourceInfo> {
    let mut track = AudioTrack::open(source, opts.hint_extension.as_deref())?;
    let info = SourceInfo {
        sample_rate: track.sample_rate(),
        declared_frames: track.declared_frames(),
    };

    let mut pipeline = AudioPipeline::new();
    let mut keep_going = true;
    while keep_going {
        let pulled = track.pull(|decoded| {
            keep_going = pipeline
                .push_decoded_and_emit(&decoded, opts.target_chunk_frames, |chunk| {
                    sink.on_samples(chunk)
                })
                .context("audio pipeline failed while processing decoded samples")?;
            Ok(())
        })?;
        if pulled == Pull::End {
            break;
        }
    }
    track.finish()?;

    if keep_going {
        // Flush any buffered resampler tail.
        pipeline
            .finalize(opts.target_chunk_frames, |chunk| sink.on_samples(chunk))
            .context("audio pipeline failed during finalize")?;
    }

    Ok(info)
}

struct LockedRead<R> {
    inner: Mutex<R>,
}

impl<R> LockedRead<R> {
    fn new(inner: R) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }
}

impl<R: Read> Read for LockedRead<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner
            .lock()
            .map_err(|_| std::io::Error::other("decoder input mutex poisoned"))?
            .read(buf)
    }
}
