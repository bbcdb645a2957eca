//! Short-time Fourier transform over centered, zero-padded frames.

use anyhow::{Result, anyhow, ensure};
use ndarray::Array2;
use realfft::RealFftPlanner;

/// Periodic Hann window (the FFT-friendly variant, `w[n] = 0.5 - 0.5 cos(2πn/N)`).
pub(crate) fn hann_window(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| {
            let phase = 2.0 * std::f64::consts::PI * i as f64 / n as f64;
            (0.5 - 0.5 * phase.cos()) as f32
        })
        .collect()
}

/// Number of centered frames for a signal of `len` samples.
pub(crate) fn frame_count(len: usize, hop: usize) -> usize {
    1 + len / hop
}

/// Frequency (Hz) of each of the `n_fft / 2 + 1` bins.
pub(crate) fn fft_frequencies(sample_rate: f32, n_fft: usize) -> Vec<f32> {
    (0..=n_fft / 2)
        .map(|k| k as f32 * sample_rate / n_fft as f32)
        .collect()
}

/// Magnitude spectrogram with shape `(n_fft / 2 + 1, frames)`.
///
/// Frame `t` is centered on sample `t * hop`; the signal is zero-padded by `n_fft / 2` on
/// both sides so every sample contributes to the same number of frames.
pub(crate) fn magnitude_spectrogram(samples: &[f32], n_fft: usize, hop: usize) -> Result<Array2<f32>> {
    ensure!(!samples.is_empty(), "cannot compute a spectrogram of an empty signal");
    ensure!(n_fft >= 2 && hop > 0, "invalid STFT geometry");

    let pad = n_fft / 2;
    let mut padded = vec![0.0_f32; samples.len() + 2 * pad];
    padded[pad..pad + samples.len()].copy_from_slice(samples);

    let n_frames = frame_count(samples.len(), hop);
    let n_bins = n_fft / 2 + 1;
    let window = hann_window(n_fft);

    let mut planner = RealFftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(n_fft);
    let mut frame = fft.make_input_vec();
    let mut spectrum = fft.make_output_vec();
    let mut scratch = fft.make_scratch_vec();

    let mut mag = Array2::<f32>::zeros((n_bins, n_frames));
    for t in 0..n_frames {
        let start = t * hop;
        for ((dst, &src), &w) in frame
            .iter_mut()
            .zip(&padded[start..start + n_fft])
            .zip(&window)
        {
            *dst = src * w;
        }

        fft.process_with_scratch(&mut frame, &mut spectrum, &mut scratch)
            .map_err(|e| anyhow!("fft failed: {e:?}"))?;

        for (k, c) in spectrum.iter().enumerate() {
            mag[[k, t]] = c.norm();
        }
    }

    Ok(mag)
}
