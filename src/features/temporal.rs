//! Time-domain frame statistics (RMS energy and zero-crossing rate).
//!
//! Both use centered frames so frame `t` lines up with STFT frame `t`.

/// Root-mean-square energy of centered, zero-padded frames.
pub(crate) fn frame_rms(samples: &[f32], frame_length: usize, hop: usize) -> Vec<f32> {
    let pad = frame_length / 2;
    let n_frames = 1 + samples.len() / hop;

    (0..n_frames)
        .map(|t| {
            // Window [t*hop - pad, t*hop - pad + frame_length) in signal coordinates.
            let center = t * hop;
            let lo = center.saturating_sub(pad);
            let hi = (center + frame_length - pad).min(samples.len());
            let sum_sq: f64 = samples[lo.min(hi)..hi]
                .iter()
                .map(|&s| (s as f64) * (s as f64))
                .sum();
            (sum_sq / frame_length as f64).sqrt() as f32
        })
        .collect()
}

/// Fraction of sign changes per centered frame; edges are padded by repeating the end samples.
///
/// Values with magnitude ≤ 1e-10 count as zero, and zero counts as positive.
pub(crate) fn zero_crossing_rate(samples: &[f32], frame_length: usize, hop: usize) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }

    let pad = frame_length / 2;
    let n = samples.len();
    let at = |i: isize| -> bool {
        let idx = i.clamp(0, n as isize - 1) as usize;
        let v = samples[idx];
        // Sign bit of the thresholded value.
        v < 0.0 && v.abs() > 1e-10
    };

    let n_frames = 1 + n / hop;
    (0..n_frames)
        .map(|t| {
            let start = (t * hop) as isize - pad as isize;
            let crossings = (1..frame_length as isize)
                .filter(|&j| at(start + j) != at(start + j - 1))
                .count();
            crossings as f32 / frame_length as f32
        })
        .collect()
}
