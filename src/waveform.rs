//! The canonical analysis waveform and the preprocessing that produces it.
//!
//! A [`Waveform`] is only ever built by [`preprocess`], which guarantees:
//! - sample rate == [`TARGET_SAMPLE_RATE`]
//! - peak absolute amplitude == 1.0
//! - leading/trailing silence trimmed
//! - duration within the configured floor and cap

use crate::audio_pipeline::{AudioPipeline, TARGET_SAMPLE_RATE};
use crate::features::temporal::frame_rms;
use crate::features::{FRAME_LENGTH, HOP_LENGTH};
use crate::opts::{Opts, ShortAudioPolicy};
use crate::{Error, Result};

/// Decoded, resampled, normalized mono audio ready for feature extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl Waveform {
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// blake3 digest of the sample bytes, used as a cache key for raw-array requests.
    pub fn content_hash(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.sample_rate.to_le_bytes());
        for s in &self.samples {
            hasher.update(&s.to_le_bytes());
        }
        hasher.finalize()
    }
}

/// Bring mono samples at `src_rate` into the canonical waveform shape.
///
/// Steps, in order: resample → peak-normalize → trim silence → enforce the duration policy.
pub fn preprocess(samples: Vec<f32>, src_rate: u32, opts: &Opts) -> Result<Waveform> {
    if samples.is_empty() {
        return Err(Error::preprocess("audio contains no samples"));
    }
    if samples.iter().any(|s| !s.is_finite()) {
        return Err(Error::preprocess("audio contains non-finite samples"));
    }

    let mut samples = resample_to_target(samples, src_rate)?;

    if !normalize_peak(&mut samples) {
        return Err(Error::preprocess("audio is silent"));
    }

    let (start, end) = nonsilent_bounds(&samples, opts.trim_top_db);
    samples.truncate(end);
    samples.drain(..start);

    enforce_duration(samples, opts)
}

/// Resample to the target rate; a no-op when the source already matches.
pub(crate) fn resample_to_target(samples: Vec<f32>, src_rate: u32) -> Result<Vec<f32>> {
    if src_rate == 0 {
        return Err(Error::preprocess("sample rate must be non-zero"));
    }
    if src_rate == TARGET_SAMPLE_RATE {
        return Ok(samples);
    }

    let mut out = Vec::with_capacity(
        (samples.len() as f64 * TARGET_SAMPLE_RATE as f64 / src_rate as f64) as usize + 1,
    );
    let mut pipeline = AudioPipeline::new();
    let mut collect = |chunk: &[f32]| -> anyhow::Result<bool> {
        out.extend_from_slice(chunk);
        Ok(true)
    };
    pipeline
        .push_mono_and_emit(&samples, src_rate, 4096, &mut collect)
        .and_then(|_| pipeline.finalize(4096, &mut collect))
        .map_err(|e| Error::preprocess(format!("resampling failed: {e:#}")))?;
    Ok(out)
}

/// Scale so that `max(|x|) == 1.0`. Returns `false` (leaving samples untouched) for silence.
pub(crate) fn normalize_peak(samples: &mut [f32]) -> bool {
    let peak = samples.iter().fold(0.0_f32, |m, s| m.max(s.abs()));
    if peak <= f32::MIN_POSITIVE {
        return false;
    }
    let gain = 1.0 / peak;
    for s in samples.iter_mut() {
        *s *= gain;
    }
    true
}

/// Sample range `[start, end)` spanning every frame louder than `top_db` below the loudest.
///
/// Frames are centered RMS frames (`FRAME_LENGTH`/`HOP_LENGTH`); a frame index maps to
/// sample `index * HOP_LENGTH`, so the bounds are hop-aligned.
pub(crate) fn nonsilent_bounds(samples: &[f32], top_db: f32) -> (usize, usize) {
    let rms = frame_rms(samples, FRAME_LENGTH, HOP_LENGTH);
    let power: Vec<f64> = rms.iter().map(|r| (*r as f64) * (*r as f64)).collect();
    let ref_power = power.iter().cloned().fold(0.0_f64, f64::max);
    if ref_power <= 0.0 {
        return (0, 0);
    }

    let threshold = ref_power * 10f64.powf(-(top_db as f64) / 10.0);
    let loud = |p: &f64| *p > threshold;

    let Some(first) = power.iter().position(loud) else {
        return (0, 0);
    };
    let last = power.iter().rposition(loud).unwrap_or(first);

    let start = first * HOP_LENGTH;
    let end = ((last + 1) * HOP_LENGTH).min(samples.len());
    (start.min(end), end)
}

/// Number of samples that corresponds to the configured minimum duration.
pub fn min_duration_samples(opts: &Opts) -> usize {
    (opts.min_duration_seconds as f64 * TARGET_SAMPLE_RATE as f64).ceil() as usize
}

/// Number of samples that corresponds to the configured analysis cap.
pub fn max_duration_samples(opts: &Opts) -> usize {
    (opts.max_duration_seconds as f64 * TARGET_SAMPLE_RATE as f64).floor() as usize
}

fn enforce_duration(mut samples: Vec<f32>, opts: &Opts) -> Result<Waveform> {
    if samples.is_empty() {
        return Err(Error::preprocess("no audio left after trimming silence"));
    }

    let cap = max_duration_samples(opts);
    if cap > 0 && samples.len() > cap {
        samples.truncate(cap);
    }

    let floor = min_duration_samples(opts);
    if samples.len() < floor {
        match opts.short_audio_policy {
            ShortAudioPolicy::Reject => {
                return Err(Error::preprocess(format!(
                    "audio too short after trimming: {:.3}s < {:.3}s minimum",
                    samples.len() as f64 / TARGET_SAMPLE_RATE as f64,
                    opts.min_duration_seconds
                )));
            }
            ShortAudioPolicy::ZeroPad => samples.resize(floor, 0.0),
        }
    }

    Ok(Waveform {
        samples,
        sample_rate: TARGET_SAMPLE_RATE,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len: usize, amp: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amp * (2.0 * std::f32::consts::PI * 220.0 * i as f32 / 22_050.0).sin())
            .collect()
    }

    #[test]
    fn normalize_peak_scales_to_unity() {
        let mut s = vec![0.25, -0.5, 0.1];
        assert!(normalize_peak(&mut s));
        assert_eq!(s, vec![0.5, -1.0, 0.2]);
    }

    #[test]
    fn normalize_peak_leaves_silence_alone() {
        let mut s = vec![0.0; 4];
        assert!(!normalize_peak(&mut s));
        assert_eq!(s, vec![0.0; 4]);
    }

    #[test]
    fn trim_removes_leading_and_trailing_silence() {
        let mut samples = vec![0.0; 22_050];
        samples.extend(tone(22_050, 1.0));
        samples.extend(vec![0.0; 22_050]);

        let (start, end) = nonsilent_bounds(&samples, 20.0);
        // Centered frames reach one frame-half into the silence on each side.
        assert!(start >= 22_050 - FRAME_LENGTH && start <= 22_050, "start={start}");
        assert!(end >= 44_100 && end <= 44_100 + FRAME_LENGTH, "end={end}");
        assert_eq!(start % HOP_LENGTH, 0);
    }

    #[test]
    fn silent_audio_is_rejected() {
        let err = preprocess(vec![0.0; 22_050], 22_050, &Opts::default()).unwrap_err();
        assert!(matches!(err, Error::Preprocess(_)));
    }

    #[test]
    fn long_audio_is_truncated_to_cap() -> anyhow::Result<()> {
        let opts = Opts {
            max_duration_seconds: 1.0,
            ..Opts::default()
        };
        let wf = preprocess(tone(3 * 22_050, 0.3), 22_050, &opts)?;
        assert_eq!(wf.len(), 22_050);
        Ok(())
    }

    #[test]
    fn content_hash_depends_on_samples() -> anyhow::Result<()> {
        let a = preprocess(tone(22_050, 0.3), 22_050, &Opts::default())?;
        let b = preprocess(tone(22_050, 0.3), 22_050, &Opts::default())?;
        let mut other = tone(22_050, 0.3);
        other[100] += 0.1;
        let c = preprocess(other, 22_050, &Opts::default())?;
        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
        Ok(())
    }
}
