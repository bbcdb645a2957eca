//! Audio normalization pipeline for clonewatch.
//!
//! Responsibilities:
//! - Convert Symphonia-decoded PCM into interleaved `f32`
//! - Downmix to mono
//! - Resample to the canonical analysis rate (when needed)
//! - Emit fixed-size chunks via a callback (incremental consumption)
//!
//! Notes:
//! - Audio already at the target rate passes through untouched (bit-exact).
//! - The resampler's group delay is skipped and the output length is trimmed to
//!   `round(src_frames * ratio)`, so resampled audio stays time-aligned with the source.
//! - `finalize()` should be called at end-of-stream to flush any remaining resampler input.

use anyhow::{Context, Result, anyhow, bail};
use rubato::{Resampler, SincFixedIn, WindowFunction};
use symphonia::core::audio::{AudioBufferRef, SampleBuffer};

/// Canonical mono analysis sample rate (Hz). Models are trained against this rate.
pub const TARGET_SAMPLE_RATE: u32 = 22_050;

/// Source frames fed to rubato per `process()` call.
const RESAMPLER_CHUNK_FRAMES: usize = 2048;

/// A small stateful pipeline that converts decoded audio into mono target-rate `f32` chunks.
pub struct AudioPipeline {
    // Scratch buffer used to copy decoded PCM into an interleaved `Vec<f32>`.
    sample_buf_f32: Option<SampleBuffer<f32>>,

    // Source rate of the first buffer we saw; a stream may not change rate midway.
    src_rate: Option<u32>,

    // Lazily initialized resampler (only needed when the source rate differs).
    resampling: Option<Resampling>,
}

struct Resampling {
    resampler: SincFixedIn<f32>,
    ratio: f64,

    // Accumulator for mono source samples before feeding full blocks into rubato.
    mono_src_acc: Vec<f32>,

    // Total source frames pushed, used to derive the expected output length.
    src_frames: usize,

    // Leading output frames still to discard (resampler group delay).
    delay_remaining: usize,

    // Output frames emitted so far.
    emitted: usize,
}

impl Default for AudioPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioPipeline {
    /// Create a new audio pipeline with empty internal buffers.
    pub fn new() -> Self {
        Self {
            sample_buf_f32: None,
            src_rate: None,
            resampling: None,
        }
    }

    /// Push a decoded Symphonia buffer through the pipeline and emit target-rate mono chunks.
    ///
    /// Returning `Ok(false)` from `emit` signals "stop early"; this call then returns `Ok(false)`.
    pub fn push_decoded_and_emit(
        &mut self,
        decoded: &AudioBufferRef<'_>,
        target_chunk_frames: usize,
        emit: impl FnMut(&[f32]) -> Result<bool>,
    ) -> Result<bool> {
        let (interleaved, src_rate, channels) =
            decoded_to_interleaved_f32(decoded, &mut self.sample_buf_f32)?;

        let mono_src = downmix_to_mono(&interleaved, channels);
        self.push_mono_and_emit(&mono_src, src_rate, target_chunk_frames, emit)
    }

    /// Push already-mono samples recorded at `src_rate`.
    ///
    /// This is the entry point for raw sample arrays that never went through a container.
    pub fn push_mono_and_emit(
        &mut self,
        mono_src: &[f32],
        src_rate: u32,
        target_chunk_frames: usize,
        mut emit: impl FnMut(&[f32]) -> Result<bool>,
    ) -> Result<bool> {
        if src_rate == 0 {
            bail!("source sample rate must be non-zero");
        }
        match self.src_rate {
            None => self.src_rate = Some(src_rate),
            Some(prev) if prev != src_rate => {
                bail!("sample rate changed mid-stream ({prev} Hz -> {src_rate} Hz)")
            }
            Some(_) => {}
        }

        // Fast path: already at the target sample rate.
        if src_rate == TARGET_SAMPLE_RATE {
            return emit_mono_chunks(mono_src, target_chunk_frames, &mut emit);
        }

        // Slow path: resample to the target sample rate.
        self.ensure_resampler(src_rate)?;
        let rs = self
            .resampling
            .as_mut()
            .ok_or_else(|| anyhow!("resampler not initialized"))?;
        rs.mono_src_acc.extend_from_slice(mono_src);
        rs.src_frames += mono_src.len();
        rs.drain_full_blocks(target_chunk_frames, &mut emit)
    }

    /// Flush remaining buffered samples at end-of-stream.
    ///
    /// If resampling was never needed, this is a no-op.
    pub fn finalize(
        &mut self,
        target_chunk_frames: usize,
        mut emit: impl FnMut(&[f32]) -> Result<bool>,
    ) -> Result<()> {
        let Some(rs) = self.resampling.as_mut() else {
            return Ok(());
        };

        // Feed zero blocks until the delayed tail has been pushed out of the filter.
        let in_max = rs.resampler.input_frames_max();
        let mut guard = 0usize;
        while rs.emitted < rs.expected_output_frames() {
            let rem = rs.mono_src_acc.len() % in_max;
            let pad = if rem == 0 && !rs.mono_src_acc.is_empty() {
                0
            } else {
                in_max - rem
            };
            rs.mono_src_acc.resize(rs.mono_src_acc.len() + pad, 0.0);

            if !rs.drain_full_blocks(target_chunk_frames, &mut emit)? {
                return Ok(());
            }

            guard += 1;
            if guard > 64 {
                bail!("resampler failed to flush its tail");
            }
        }

        Ok(())
    }

    fn ensure_resampler(&mut self, src_rate: u32) -> Result<()> {
        if self.resampling.is_some() {
            return Ok(());
        }

        let ratio = TARGET_SAMPLE_RATE as f64 / src_rate as f64;
        let resampler = SincFixedIn::<f32>::new(
            ratio,
            2.0,
            rubato::SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: rubato::SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            },
            RESAMPLER_CHUNK_FRAMES,
            1, // mono
        )
        .map_err(|e| anyhow!(e))
        .context("failed to init resampler")?;

        let delay = resampler.output_delay();
        self.resampling = Some(Resampling {
            resampler,
            ratio,
            mono_src_acc: Vec::new(),
            src_frames: 0,
            delay_remaining: delay,
            emitted: 0,
        });
        Ok(())
    }
}

impl Resampling {
    fn expected_output_frames(&self) -> usize {
        (self.src_frames as f64 * self.ratio).round() as usize
    }

    /// Resample every complete input block and emit the delay-compensated output.
    fn drain_full_blocks(
        &mut self,
        target_chunk_frames: usize,
        emit: &mut impl FnMut(&[f32]) -> Result<bool>,
    ) -> Result<bool> {
        let in_max = self.resampler.input_frames_max();

        while self.mono_src_acc.len() >= in_max {
            let block: Vec<f32> = self.mono_src_acc.drain(..in_max).collect();
            let out = self
                .resampler
                .process(&[block], None)
                .map_err(|e| anyhow!(e))
                .context("resampler process failed")?;

            let [chan] = out.as_slice() else {
                bail!("expected mono output from resampler");
            };

            let skip = self.delay_remaining.min(chan.len());
            self.delay_remaining -= skip;

            let budget = self.expected_output_frames().saturating_sub(self.emitted);
            let usable = &chan[skip..];
            let usable = &usable[..usable.len().min(budget)];
            self.emitted += usable.len();

            if !emit_mono_chunks(usable, target_chunk_frames, emit)? {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

fn decoded_to_interleaved_f32(
    decoded: &AudioBufferRef<'_>,
    sample_buf_f32: &mut Option<SampleBuffer<f32>>,
) -> Result<(Vec<f32>, u32, usize)> {
    ensure_sample_buffer(decoded, sample_buf_f32);

    let buf = sample_buf_f32
        .as_mut()
        .ok_or_else(|| anyhow!("sample buffer not initialized"))?;

    // Copy decoded PCM into our interleaved scratch buffer.
    buf.copy_interleaved_ref(decoded.clone());

    let src_rate = decoded.spec().rate;
    let channels = decoded.spec().channels.count();
    if channels == 0 {
        bail!("decoded audio had zero channels");
    }

    Ok((buf.samples().to_vec(), src_rate, channels))
}

fn ensure_sample_buffer(
    decoded: &AudioBufferRef<'_>,
    sample_buf_f32: &mut Option<SampleBuffer<f32>>,
) {
    // Packets can grow (e.g. variable frame sizes); reallocate when the scratch is too small.
    let needed = decoded.capacity() as u64;
    let fits = sample_buf_f32
        .as_ref()
        .is_some_and(|b| b.capacity() as u64 >= needed * decoded.spec().channels.count() as u64);
    if fits {
        return;
    }

    let spec = *decoded.spec();
    *sample_buf_f32 = Some(SampleBuffer::<f32>::new(needed, spec));
}

/// Downmix interleaved samples into mono by averaging channels.
///
/// Policy: equal-weight average across channels (simple, predictable).
fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return interleaved.to_vec();
    }

    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Emit mono target-rate samples to the callback in fixed-size chunks.
fn emit_mono_chunks(
    mono: &[f32],
    chunk_frames: usize,
    emit: &mut impl FnMut(&[f32]) -> Result<bool>,
) -> Result<bool> {
    for chunk in mono.chunks(chunk_frames.max(1)) {
        if !emit(chunk)? {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_mono(samples: &[f32], rate: u32) -> anyhow::Result<Vec<f32>> {
        let mut out = Vec::new();
        let mut pipeline = AudioPipeline::new();
        pipeline.push_mono_and_emit(samples, rate, 512, |c| {
            out.extend_from_slice(c);
            Ok(true)
        })?;
        pipeline.finalize(512, |c| {
            out.extend_from_slice(c);
            Ok(true)
        })?;
        Ok(out)
    }

    #[test]
    fn finalize_is_noop_without_resampler() -> anyhow::Result<()> {
        let mut pipeline = AudioPipeline::new();
        pipeline.finalize(256, |_| Ok(true))?;
        Ok(())
    }

    #[test]
    fn downmix_to_mono_single_channel_is_identity() {
        let input = vec![0.0, 1.0, -1.0];
        let mono = downmix_to_mono(&input, 1);
        assert_eq!(mono, input);
    }

    #[test]
    fn downmix_to_mono_averages_channels() {
        // Two frames of stereo: (L=1, R=3), (L=-1, R=1) => mono: 2, 0
        let interleaved = vec![1.0, 3.0, -1.0, 1.0];
        let mono = downmix_to_mono(&interleaved, 2);
        assert_eq!(mono, vec![2.0, 0.0]);
    }

    #[test]
    fn emit_mono_chunks_respects_early_stop() -> anyhow::Result<()> {
        let mut seen = Vec::new();
        let mono = vec![1.0; 10];
        let keep_going = emit_mono_chunks(&mono, 4, &mut |chunk| {
            seen.push(chunk.len());
            Ok(false)
        })?;

        assert!(!keep_going);
        assert_eq!(seen, vec![4]);
        Ok(())
    }

    #[test]
    fn target_rate_input_passes_through_unchanged() -> anyhow::Result<()> {
        let samples: Vec<f32> = (0..5000).map(|i| (i as f32 * 0.01).sin()).collect();
        let out = run_mono(&samples, TARGET_SAMPLE_RATE)?;
        assert_eq!(out, samples);
        Ok(())
    }

    #[test]
    fn resampled_length_tracks_the_rate_ratio() -> anyhow::Result<()> {
        let samples = vec![0.25_f32; 16_000];
        let out = run_mono(&samples, 16_000)?;
        assert_eq!(out.len(), TARGET_SAMPLE_RATE as usize);
        Ok(())
    }

    #[test]
    fn resampling_keeps_a_sine_near_its_amplitude() -> anyhow::Result<()> {
        let rate = 44_100u32;
        let samples: Vec<f32> = (0..rate as usize)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / rate as f32).sin())
            .collect();
        let out = run_mono(&samples, rate)?;
        assert_eq!(out.len(), 22_050);

        // Skip filter edges and check the steady-state peak.
        let peak = out[2000..20_000]
            .iter()
            .fold(0.0_f32, |m, s| m.max(s.abs()));
        assert!((peak - 0.5).abs() < 0.02, "peak was {peak}");
        Ok(())
    }

    #[test]
    fn rate_change_mid_stream_is_rejected() {
        let mut pipeline = AudioPipeline::new();
        let first = pipeline.push_mono_and_emit(&[0.0; 8], 16_000, 4, |_| Ok(true));
        assert!(first.is_ok());
        let err = pipeline
            .push_mono_and_emit(&[0.0; 8], 8_000, 4, |_| Ok(true))
            .unwrap_err();
        assert!(err.to_string().contains("sample rate changed"));
    }
}
