//! Mel filterbanks, decibel conversion and cepstral coefficients.
//!
//! The mel scale is the Slaney variant (linear below 1 kHz, logarithmic above) and filters are
//! area-normalized, which is what the trained models' reference features used.

use ndarray::Array2;

/// Floor applied before taking logarithms of power values.
pub(crate) const AMIN: f32 = 1e-10;

/// Dynamic range kept by [`power_to_db`] below the loudest value.
pub(crate) const TOP_DB: f32 = 80.0;

const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;

fn log_step() -> f64 {
    6.4_f64.ln() / 27.0
}

pub(crate) fn hz_to_mel(hz: f64) -> f64 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

pub(crate) fn mel_to_hz(mel: f64) -> f64 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        F_SP * mel
    }
}

/// Triangular mel filterbank with shape `(n_mels, n_fft / 2 + 1)` covering `0..sr/2`.
pub(crate) fn mel_filterbank(sample_rate: f32, n_fft: usize, n_mels: usize) -> Array2<f32> {
    let n_bins = n_fft / 2 + 1;
    let fmax = sample_rate as f64 / 2.0;

    let mel_max = hz_to_mel(fmax);
    let mel_f: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_max * i as f64 / (n_mels + 1) as f64))
        .collect();
    let fft_f: Vec<f64> = (0..n_bins)
        .map(|k| k as f64 * fmax / (n_bins - 1) as f64)
        .collect();

    let mut weights = Array2::<f32>::zeros((n_mels, n_bins));
    for m in 0..n_mels {
        let (lo, mid, hi) = (mel_f[m], mel_f[m + 1], mel_f[m + 2]);
        let enorm = 2.0 / (hi - lo);
        for (k, &f) in fft_f.iter().enumerate() {
            let lower = (f - lo) / (mid - lo);
            let upper = (hi - f) / (hi - mid);
            let w = lower.min(upper).max(0.0);
            weights[[m, k]] = (w * enorm) as f32;
        }
    }
    weights
}

/// Reference level for [`power_to_db`].
#[derive(Debug, Clone, Copy)]
pub(crate) enum DbRef {
    /// 0 dB == power 1.0.
    Unit,
    /// 0 dB == the loudest value in the input.
    Max,
}

/// `10·log10(S / ref)`, floored at `AMIN` and clipped to `TOP_DB` below the peak.
pub(crate) fn power_to_db(power: &Array2<f32>, reference: DbRef) -> Array2<f32> {
    let ref_value = match reference {
        DbRef::Unit => 1.0,
        DbRef::Max => power.iter().copied().fold(0.0_f32, f32::max),
    };
    let ref_db = 10.0 * ref_value.max(AMIN).log10();

    let mut db = power.mapv(|p| 10.0 * p.max(AMIN).log10() - ref_db);
    let peak = db.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let floor = peak - TOP_DB;
    db.mapv_inplace(|v| v.max(floor));
    db
}

/// Orthonormal DCT-II basis with shape `(n_out, n_in)`.
pub(crate) fn dct_ortho(n_out: usize, n_in: usize) -> Array2<f32> {
    let n = n_in as f64;
    Array2::from_shape_fn((n_out, n_in), |(k, i)| {
        let scale = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
        let angle = std::f64::consts::PI * k as f64 * (2.0 * i as f64 + 1.0) / (2.0 * n);
        (scale * angle.cos()) as f32
    })
}

/// Cepstral coefficients from a `(n_mels, frames)` dB mel spectrogram.
pub(crate) fn mfcc(mel_db: &Array2<f32>, n_mfcc: usize) -> Array2<f32> {
    dct_ortho(n_mfcc, mel_db.nrows()).dot(mel_db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn mel_scale_round_trips() {
        for hz in [0.0, 440.0, 1000.0, 4000.0, 11_025.0] {
            assert!((mel_to_hz(hz_to_mel(hz)) - hz).abs() < 1e-6);
        }
        assert!((hz_to_mel(1000.0) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn filterbank_has_one_nonzero_region_per_filter() {
        let fb = mel_filterbank(22_050.0, 2048, 13);
        assert_eq!(fb.dim(), (13, 1025));
        for row in fb.rows() {
            assert!(row.iter().any(|&w| w > 0.0));
            assert!(row.iter().all(|&w| w >= 0.0));
        }
    }

    #[test]
    fn power_to_db_clips_dynamic_range() {
        let p = array![[1.0_f32, 1e-12], [0.1, 0.01]];
        let db = power_to_db(&p, DbRef::Unit);
        assert!((db[[0, 0]] - 0.0).abs() < 1e-5);
        assert!((db[[1, 0]] + 10.0).abs() < 1e-5);
        assert!((db[[0, 1]] + 80.0).abs() < 1e-5);

        let rel = power_to_db(&array![[4.0_f32, 0.4]], DbRef::Max);
        assert!((rel[[0, 0]]).abs() < 1e-5);
        assert!((rel[[0, 1]] + 10.0).abs() < 1e-4);
    }

    #[test]
    fn dct_basis_is_orthonormal() {
        let d = dct_ortho(8, 8);
        let eye = d.dot(&d.t());
        for i in 0..8 {
            for j in 0..8 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((eye[[i, j]] - expected).abs() < 1e-5);
            }
        }
    }
}
