//! Deterministic synthetic voices at [`TARGET_SAMPLE_RATE`].
//!
//! These are not meant to sound convincing. They exercise the acoustic cues the feature
//! extractor is built around: a "natural" voice has a moving pitch, graded harmonics,
//! micro-variation and pauses, while a "cloned" voice is static and evenly voiced.
//! Used by tests, the CLI `synth` subcommand and trainer smoke runs.

use std::f32::consts::TAU;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::audio_pipeline::TARGET_SAMPLE_RATE;

const HARMONICS: usize = 8;
const OUTPUT_PEAK: f32 = 0.8;

fn sample_count(seconds: f32) -> usize {
    (seconds.max(0.0) as f64 * TARGET_SAMPLE_RATE as f64).round() as usize
}

/// A voice with vibrato, pitch drift, jitter and shimmer, `1/k^1.2` harmonic decay, a
/// syllable envelope with short pauses, and light breath noise.
pub fn natural_voice(seconds: f32, seed: u64) -> Vec<f32> {
    let n = sample_count(seconds);
    let sr = TARGET_SAMPLE_RATE as f32;
    let mut rng = StdRng::seed_from_u64(seed);

    let f0 = 150.0 * rng.gen_range(0.85..1.15);
    let vibrato_rate = rng.gen_range(4.0..6.0);
    let vibrato_depth = rng.gen_range(0.01..0.03);
    let vibrato_phase = rng.gen_range(0.0..TAU);
    let drift_rate = rng.gen_range(0.1..0.5);
    let drift_phase = rng.gen_range(0.0..TAU);
    let weights: Vec<f32> = (1..=HARMONICS)
        .map(|k| rng.gen_range(0.8..1.2) / (k as f32).powf(1.2))
        .collect();

    let envelope = syllable_envelope(n, &mut rng);

    // Jitter and shimmer are held for ~5 ms and smoothed so they read as micro-variation
    // rather than broadband noise.
    let hold = (0.005 * sr) as usize;
    let (mut jitter_target, mut shimmer_target) = (0.0_f32, 0.0_f32);
    let (mut jitter, mut shimmer) = (0.0_f32, 0.0_f32);

    let mut phases = [0.0_f32; HARMONICS];
    let mut out = Vec::with_capacity(n);
    for (i, env) in envelope.iter().enumerate() {
        if i % hold.max(1) == 0 {
            jitter_target = rng.gen_range(-0.006..0.006);
            shimmer_target = rng.gen_range(-0.08..0.08);
        }
        jitter += 0.02 * (jitter_target - jitter);
        shimmer += 0.02 * (shimmer_target - shimmer);

        let t = i as f32 / sr;
        let vibrato = vibrato_depth * (TAU * vibrato_rate * t + vibrato_phase).sin();
        let drift = 0.04 * (TAU * drift_rate * t + drift_phase).sin();
        let f = f0 * (1.0 + vibrato + drift + jitter);

        let mut voiced = 0.0;
        for (k, (phase, w)) in phases.iter_mut().zip(&weights).enumerate() {
            *phase = (*phase + TAU * f * (k + 1) as f32 / sr) % TAU;
            voiced += w * phase.sin();
        }

        let breath: f32 = 0.004 * rng.gen_range(-1.0..1.0);
        out.push(voiced * env * (1.0 + shimmer) + breath * env.max(0.05));
    }

    scale_to_peak(&mut out);
    out
}

/// A voice with constant pitch, equal-weight harmonics, no vibrato, and a hard-stepped
/// amplitude envelope without pauses.
pub fn cloned_voice(seconds: f32, seed: u64) -> Vec<f32> {
    let n = sample_count(seconds);
    let sr = TARGET_SAMPLE_RATE as f32;
    let mut rng = StdRng::seed_from_u64(seed);

    let f0 = 150.0 * rng.gen_range(0.85..1.15);
    let step = (0.25 * sr) as usize;
    let mut level = 1.0_f32;

    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        if i % step.max(1) == 0 {
            level = if rng.gen_bool(0.5) { 1.0 } else { 0.6 };
        }
        let t = i as f32 / sr;
        let voiced: f32 = (1..=HARMONICS)
            .map(|k| (TAU * f0 * k as f32 * t).sin())
            .sum::<f32>()
            / HARMONICS as f32;
        out.push(voiced * level + 0.0002 * rng.gen_range(-1.0_f32..1.0));
    }

    scale_to_peak(&mut out);
    out
}

/// Raised-sine syllables of 150–350 ms separated by 30–120 ms pauses.
fn syllable_envelope(n: usize, rng: &mut StdRng) -> Vec<f32> {
    let sr = TARGET_SAMPLE_RATE as f32;
    let mut env = vec![0.0_f32; n];
    let mut pos = 0;
    while pos < n {
        let len = ((rng.gen_range(0.15..0.35) * sr) as usize).min(n - pos);
        let level = rng.gen_range(0.6..1.0);
        for j in 0..len {
            let x = (j as f32 + 0.5) / len as f32;
            // Flattened top: the raised sine is clipped so most of the syllable is voiced.
            env[pos + j] = level * ((std::f32::consts::PI * x).sin() * 1.6).min(1.0);
        }
        pos += len;
        pos += (rng.gen_range(0.03..0.12) * sr) as usize;
    }
    env
}

fn scale_to_peak(samples: &mut [f32]) {
    let peak = samples.iter().fold(0.0_f32, |m, s| m.max(s.abs()));
    if peak > 0.0 {
        let gain = OUTPUT_PEAK / peak;
        samples.iter_mut().for_each(|s| *s *= gain);
    }
}
