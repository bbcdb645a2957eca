//! Median-filter harmonic/percussive separation on a magnitude spectrogram.
//!
//! - Harmonic content is smooth along time, so it survives a median filter across frames.
//! - Percussive content is smooth along frequency, so it survives a median filter across bins.
//! - Soft masks (power 2) split each cell between the two; cells where both filters are
//!   zero go to neither.

use ndarray::{Array2, Axis};

/// Median filter length in both directions.
pub(crate) const KERNEL: usize = 31;

const MASK_POWER: i32 = 2;

/// Stabilizer added to denominators of the energy ratios.
const RATIO_EPS: f64 = 1e-10;

#[derive(Debug)]
pub(crate) struct Hpss {
    /// Harmonic magnitude spectrogram, same shape as the input.
    pub harmonic: Array2<f32>,
    pub harmonic_energy: f64,
    pub percussive_energy: f64,
    pub total_energy: f64,
}

impl Hpss {
    /// `[harmonic/total, percussive/total, harmonic/percussive]`.
    pub fn ratios(&self) -> [f32; 3] {
        [
            (self.harmonic_energy / (self.total_energy + RATIO_EPS)) as f32,
            (self.percussive_energy / (self.total_energy + RATIO_EPS)) as f32,
            (self.harmonic_energy / (self.percussive_energy + RATIO_EPS)) as f32,
        ]
    }
}

/// Index into `0..n` with half-sample symmetric reflection (`d c b a | a b c d | d c b a`).
fn reflect(i: isize, n: usize) -> usize {
    let n = n as isize;
    let period = 2 * n;
    let mut i = i.rem_euclid(period);
    if i >= n {
        i = period - i - 1;
    }
    i as usize
}

/// Running median of width `KERNEL` over each lane of `m` along `axis`.
fn median_filter(m: &Array2<f32>, axis: Axis) -> Array2<f32> {
    let mut out = Array2::<f32>::zeros(m.raw_dim());
    let half = (KERNEL / 2) as isize;
    let mut window = vec![0.0_f32; KERNEL];

    for (src, mut dst) in m.lanes(axis).into_iter().zip(out.lanes_mut(axis)) {
        let n = src.len();
        for i in 0..n {
            for (j, w) in window.iter_mut().enumerate() {
                *w = src[reflect(i as isize + j as isize - half, n)];
            }
            let (_, median, _) = window.select_nth_unstable_by(KERNEL / 2, f32::total_cmp);
            dst[i] = *median;
        }
    }
    out
}

fn soft_mask(x: f32, other: f32) -> f32 {
    let z = x.max(other);
    if z < f32::MIN_POSITIVE {
        return 0.0;
    }
    let a = (x / z).powi(MASK_POWER);
    let b = (other / z).powi(MASK_POWER);
    a / (a + b)
}

pub(crate) fn separate(mag: &Array2<f32>) -> Hpss {
    // Lanes along Axis(1) run across frames for a fixed bin.
    let harm_filtered = median_filter(mag, Axis(1));
    let perc_filtered = median_filter(mag, Axis(0));

    let mut harmonic = Array2::<f32>::zeros(mag.raw_dim());
    let (mut harmonic_energy, mut percussive_energy, mut total_energy) = (0.0_f64, 0.0_f64, 0.0_f64);

    ndarray::Zip::from(&mut harmonic)
        .and(mag)
        .and(&harm_filtered)
        .and(&perc_filtered)
        .for_each(|h, &x, &hf, &pf| {
            let hm = x * soft_mask(hf, pf);
            let pm = x * soft_mask(pf, hf);
            *h = hm;
            harmonic_energy += (hm as f64).powi(2);
            percussive_energy += (pm as f64).powi(2);
            total_energy += (x as f64).powi(2);
        });

    Hpss {
        harmonic,
        harmonic_energy,
        percussive_energy,
        total_energy,
    }
}
