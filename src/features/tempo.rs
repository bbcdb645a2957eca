//! Global tempo estimate from an onset-strength autocorrelation.
//!
//! - Onset strength: positive first difference of a 128-band mel dB spectrogram, median
//!   across bands, delayed so it lines up with the STFT frames.
//! - Tempogram: windowed autocorrelation of 8-second onset windows, averaged over time.
//! - The chosen lag maximizes the tempogram weighted by a log-normal prior around 120 BPM.

use ndarray::Array2;
use realfft::RealFftPlanner;
use realfft::num_complex::Complex;

/// Center of the tempo prior.
const PRIOR_BPM: f64 = 120.0;
/// Width of the tempo prior, in octaves.
const PRIOR_STD_OCTAVES: f64 = 1.0;
/// Tempi above this are never picked.
const MAX_BPM: f64 = 320.0;
/// Length of each autocorrelation window.
const AC_SECONDS: f64 = 8.0;

/// Onset strength per frame from a `(bands, frames)` mel dB spectrogram.
pub(crate) fn onset_envelope(mel_db: &Array2<f32>, n_fft: usize, hop: usize) -> Vec<f32> {
    let (n_bands, n_frames) = mel_db.dim();
    let delay = 1 + n_fft / (2 * hop);

    let mut env = vec![0.0_f32; n_frames];
    let mut diffs = vec![0.0_f32; n_bands];
    for t in 1..n_frames {
        let out = t - 1 + delay;
        if out >= n_frames {
            break;
        }
        for (b, d) in diffs.iter_mut().enumerate() {
            *d = (mel_db[[b, t]] - mel_db[[b, t - 1]]).max(0.0);
        }
        env[out] = median(&mut diffs);
    }
    env
}

fn median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f32::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        0.5 * (values[mid - 1] + values[mid])
    }
}

/// Pads with a linear ramp from 0 up to (and down from) the edge values.
fn ramp_pad(env: &[f32], pad: usize) -> Vec<f32> {
    let (first, last) = (env[0], env[env.len() - 1]);
    let mut out = Vec::with_capacity(env.len() + 2 * pad);
    out.extend((0..pad).map(|i| first * i as f32 / pad as f32));
    out.extend_from_slice(env);
    out.extend((0..pad).map(|j| last * (pad - 1 - j) as f32 / pad as f32));
    out
}

/// Estimated tempo in BPM, or `None` when there are no onsets to track.
pub(crate) fn estimate(onsets: &[f32], sample_rate: f32, hop: usize) -> Option<f32> {
    if onsets.iter().all(|&v| v == 0.0) {
        return None;
    }

    let frame_rate = sample_rate as f64 / hop as f64;
    let win = (AC_SECONDS * frame_rate).floor() as usize;
    if win < 2 {
        return None;
    }

    let padded = ramp_pad(onsets, win / 2);
    let window: Vec<f32> = super::stft::hann_window(win);

    let n_fft = 2 * win;
    let mut planner = RealFftPlanner::<f32>::new();
    let forward = planner.plan_fft_forward(n_fft);
    let inverse = planner.plan_fft_inverse(n_fft);
    let mut buf = forward.make_input_vec();
    let mut spec = forward.make_output_vec();
    let mut ac = inverse.make_output_vec();

    let mut mean_ac = vec![0.0_f64; win];
    let n_frames = onsets.len().min(padded.len() + 1 - win);
    for t in 0..n_frames {
        buf.fill(0.0);
        for ((dst, &src), &w) in buf.iter_mut().zip(&padded[t..t + win]).zip(&window) {
            *dst = src * w;
        }
        forward.process(&mut buf, &mut spec).ok()?;
        for c in spec.iter_mut() {
            *c = Complex::new(c.norm_sqr(), 0.0);
        }
        inverse.process(&mut spec, &mut ac).ok()?;

        let peak = ac[..win].iter().fold(0.0_f32, |m, &v| m.max(v.abs()));
        if peak > f32::MIN_POSITIVE {
            for (m, &v) in mean_ac.iter_mut().zip(&ac[..win]) {
                *m += (v / peak) as f64;
            }
        }
    }

    let mut best: Option<(f64, f64)> = None;
    for (lag, &sum) in mean_ac.iter().enumerate().skip(1) {
        let bpm = 60.0 * frame_rate / lag as f64;
        if bpm >= MAX_BPM {
            continue;
        }
        let strength = sum / n_frames as f64;
        let prior = -0.5 * ((bpm.log2() - PRIOR_BPM.log2()) / PRIOR_STD_OCTAVES).powi(2);
        let score = (1e6 * strength).ln_1p() + prior;
        if best.is_none_or(|(s, _)| score > s) {
            best = Some((score, bpm));
        }
    }

    best.map(|(_, bpm)| bpm as f32).filter(|bpm| bpm.is_finite())
}
