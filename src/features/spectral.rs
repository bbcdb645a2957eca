//! Spectral shape descriptors computed per STFT frame from a magnitude spectrogram.

use ndarray::{Array2, ArrayView1};

use super::mel::{AMIN, TOP_DB};

/// Lowest band edge for spectral contrast.
const CONTRAST_FMIN: f32 = 200.0;

/// Octave bands above `CONTRAST_FMIN`; the band below it adds one more row.
pub(crate) const CONTRAST_BANDS: usize = 6;

/// Fraction of each band averaged into its peak and valley.
const CONTRAST_QUANTILE: f32 = 0.02;

/// Share of total spectral energy below the rolloff frequency.
const ROLLOFF_PERCENT: f64 = 0.85;

fn column_sum(col: &ArrayView1<'_, f32>) -> f64 {
    col.iter().map(|&v| v as f64).sum()
}

/// Magnitude-weighted mean frequency of each frame (0 for silent frames).
pub(crate) fn centroid(mag: &Array2<f32>, freqs: &[f32]) -> Vec<f32> {
    mag.columns()
        .into_iter()
        .map(|col| {
            let total = column_sum(&col);
            if total <= f64::MIN_POSITIVE {
                return 0.0;
            }
            let weighted: f64 = col
                .iter()
                .zip(freqs)
                .map(|(&m, &f)| m as f64 * f as f64)
                .sum();
            (weighted / total) as f32
        })
        .collect()
}

/// Second-order spectral bandwidth around each frame's centroid.
pub(crate) fn bandwidth(mag: &Array2<f32>, freqs: &[f32], centroids: &[f32]) -> Vec<f32> {
    mag.columns()
        .into_iter()
        .zip(centroids)
        .map(|(col, &c)| {
            let total = column_sum(&col);
            if total <= f64::MIN_POSITIVE {
                return 0.0;
            }
            let spread: f64 = col
                .iter()
                .zip(freqs)
                .map(|(&m, &f)| {
                    let d = f as f64 - c as f64;
                    (m as f64 / total) * d * d
                })
                .sum();
            spread.sqrt() as f32
        })
        .collect()
}

/// Lowest frequency at which the cumulative magnitude reaches 85% of the frame total.
pub(crate) fn rolloff(mag: &Array2<f32>, freqs: &[f32]) -> Vec<f32> {
    mag.columns()
        .into_iter()
        .map(|col| {
            let threshold = ROLLOFF_PERCENT * column_sum(&col);
            let mut acc = 0.0_f64;
            for (&m, &f) in col.iter().zip(freqs) {
                acc += m as f64;
                if acc >= threshold {
                    return f;
                }
            }
            freqs.last().copied().unwrap_or(0.0)
        })
        .collect()
}

/// Bin membership of each contrast band (inclusive edges, neighbour bin included below).
fn contrast_band_bins(freqs: &[f32]) -> Vec<(Vec<usize>, usize)> {
    let mut edges = vec![0.0_f32];
    for i in 0..=CONTRAST_BANDS {
        edges.push(CONTRAST_FMIN * 2f32.powi(i as i32));
    }

    let mut bands = Vec::with_capacity(CONTRAST_BANDS + 1);
    for k in 0..=CONTRAST_BANDS {
        let (lo, hi) = (edges[k], edges[k + 1]);
        let mut member: Vec<bool> = freqs.iter().map(|&f| f >= lo && f <= hi).collect();
        let first = member.iter().position(|&m| m);
        let last = member.iter().rposition(|&m| m);

        if let (Some(first), Some(last)) = (first, last) {
            if k > 0 && first > 0 {
                member[first - 1] = true;
            }
            if k == CONTRAST_BANDS {
                for m in member.iter_mut().skip(last + 1) {
                    *m = true;
                }
            }
        }

        let count = member.iter().filter(|&&m| m).count();
        let mut bins: Vec<usize> = member
            .iter()
            .enumerate()
            .filter_map(|(i, &m)| m.then_some(i))
            .collect();
        // Shared upper edge bins belong to the next band.
        if k < CONTRAST_BANDS {
            bins.pop();
        }
        bands.push((bins, count));
    }
    bands
}

fn to_db_clipped(m: &Array2<f32>) -> Array2<f32> {
    let mut db = m.mapv(|v| 10.0 * v.max(AMIN).log10());
    let floor = db.iter().copied().fold(f32::NEG_INFINITY, f32::max) - TOP_DB;
    db.mapv_inplace(|v| v.max(floor));
    db
}

/// Peak-to-valley contrast (dB) per octave band; shape `(CONTRAST_BANDS + 1, frames)`.
pub(crate) fn contrast(mag: &Array2<f32>, freqs: &[f32]) -> Array2<f32> {
    let bands = contrast_band_bins(freqs);
    let n_frames = mag.ncols();
    let mut peaks = Array2::<f32>::zeros((bands.len(), n_frames));
    let mut valleys = Array2::<f32>::zeros((bands.len(), n_frames));

    let mut sorted = Vec::new();
    for (b, (bins, count)) in bands.iter().enumerate() {
        if bins.is_empty() {
            continue;
        }
        let q = ((CONTRAST_QUANTILE * *count as f32).round() as usize)
            .max(1)
            .min(bins.len());

        for t in 0..n_frames {
            sorted.clear();
            sorted.extend(bins.iter().map(|&k| mag[[k, t]]));
            sorted.sort_by(f32::total_cmp);

            let valley = sorted[..q].iter().sum::<f32>() / q as f32;
            let peak = sorted[sorted.len() - q..].iter().sum::<f32>() / q as f32;
            valleys[[b, t]] = valley;
            peaks[[b, t]] = peak;
        }
    }

    to_db_clipped(&peaks) - to_db_clipped(&valleys)
}

/// Ratio of geometric to arithmetic mean of each frame's power spectrum.
pub(crate) fn flatness(mag: &Array2<f32>) -> Vec<f32> {
    mag.columns()
        .into_iter()
        .map(|col| {
            let n = col.len() as f64;
            let mut log_sum = 0.0_f64;
            let mut sum = 0.0_f64;
            for &m in col.iter() {
                let p = ((m as f64) * (m as f64)).max(AMIN as f64);
                log_sum += p.ln();
                sum += p;
            }
            ((log_sum / n).exp() / (sum / n)) as f32
        })
        .collect()
}
