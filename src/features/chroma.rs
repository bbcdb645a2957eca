//! Pitch-class (chroma) energy and the tonal centroid (tonnetz) projection.

use ndarray::Array2;

pub(crate) const N_CHROMA: usize = 12;
pub(crate) const N_TONNETZ: usize = 6;

/// Center of the octave weighting, in octaves above C0 (≈ 880 Hz).
const CENTER_OCTAVE: f64 = 5.0;
/// Half-width (in octaves) of the gaussian octave weighting.
const OCTAVE_WIDTH: f64 = 2.0;

/// Octaves above C0 (A440 / 16) for `hz`.
fn hz_to_octaves(hz: f64) -> f64 {
    (hz / (440.0 / 16.0)).log2()
}

/// Chroma filterbank with shape `(12, n_fft / 2 + 1)`; row 0 is pitch class C.
pub(crate) fn chroma_filterbank(sample_rate: f32, n_fft: usize) -> Array2<f32> {
    let n = N_CHROMA as f64;
    let sr = sample_rate as f64;

    // Fractional chroma bin of every FFT bin; DC is placed 1.5 octaves below bin 1.
    let mut frq_bins = Vec::with_capacity(n_fft);
    for k in 1..n_fft {
        frq_bins.push(n * hz_to_octaves(k as f64 * sr / n_fft as f64));
    }
    frq_bins.insert(0, frq_bins[0] - 1.5 * n);

    let mut bin_widths: Vec<f64> = frq_bins.windows(2).map(|w| (w[1] - w[0]).max(1.0)).collect();
    bin_widths.push(1.0);

    let half = (n / 2.0).round();
    let mut wts = Array2::<f64>::zeros((N_CHROMA, n_fft));
    for (k, (&fb, &bw)) in frq_bins.iter().zip(&bin_widths).enumerate() {
        for c in 0..N_CHROMA {
            let d = (fb - c as f64 + half + 10.0 * n).rem_euclid(n) - half;
            wts[[c, k]] = (-0.5 * (2.0 * d / bw).powi(2)).exp();
        }
    }

    for mut col in wts.columns_mut() {
        let norm = col.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            col.mapv_inplace(|v| v / norm);
        }
    }

    for (k, &fb) in frq_bins.iter().enumerate() {
        let oct = (-0.5 * ((fb / n - CENTER_OCTAVE) / OCTAVE_WIDTH).powi(2)).exp();
        wts.column_mut(k).mapv_inplace(|v| v * oct);
    }

    // Rows start at A; rotate so row 0 is C.
    let n_bins = n_fft / 2 + 1;
    Array2::from_shape_fn((N_CHROMA, n_bins), |(c, k)| {
        wts[[(c + 3) % N_CHROMA, k]] as f32
    })
}

/// Chroma of a power spectrogram, each frame scaled so its strongest pitch class is 1.
pub(crate) fn chroma(power: &Array2<f32>, filterbank: &Array2<f32>) -> Array2<f32> {
    let mut raw = filterbank.dot(power);
    for mut col in raw.columns_mut() {
        let peak = col.iter().fold(0.0_f32, |m, &v| m.max(v.abs()));
        if peak > f32::MIN_POSITIVE {
            col.mapv_inplace(|v| v / peak);
        }
    }
    raw
}

/// Projection of L1-normalized chroma onto fifths, minor thirds and major thirds.
pub(crate) fn tonnetz(chroma: &Array2<f32>) -> Array2<f32> {
    const SCALE: [f64; N_TONNETZ] = [7.0 / 6.0, 7.0 / 6.0, 1.5, 1.5, 2.0 / 3.0, 2.0 / 3.0];
    const RADII: [f64; N_TONNETZ] = [1.0, 1.0, 1.0, 1.0, 0.5, 0.5];

    let phi = Array2::from_shape_fn((N_TONNETZ, N_CHROMA), |(d, c)| {
        let mut v = SCALE[d] * c as f64;
        if d % 2 == 0 {
            v -= 0.5;
        }
        (RADII[d] * (std::f64::consts::PI * v).cos()) as f32
    });

    let mut normalized = chroma.clone();
    for mut col in normalized.columns_mut() {
        let l1: f32 = col.iter().map(|v| v.abs()).sum();
        if l1 > f32::MIN_POSITIVE {
            col.mapv_inplace(|v| v / l1);
        }
    }
    phi.dot(&normalized)
}
