//! Fixed-layout acoustic feature extraction.
//!
//! [`extract`] is the single function used both at inference time and by the trainer, so a
//! model never sees features computed differently from the ones it was fit on.
//!
//! Layout (group order is part of the model contract, see [`FEATURE_LAYOUT_VERSION`]):
//! - `mfcc`: 13 coefficients × mean/std/min/max (all means first, then stds, ...)
//! - `spectral_centroid`, `spectral_rolloff`, `spectral_bandwidth`: mean/std/min/max each
//! - `spectral_contrast`: 7 band means then 7 band stds
//! - `zero_crossing_rate`: mean/std/min/max
//! - `chroma`: 12 pitch-class means then 12 stds
//! - `mel_bands`: 13 mel-band dB means then 13 stds
//! - `hpss`: harmonic/total, percussive/total, harmonic/percussive energy
//! - `tempo`: global BPM (falls back to [`DEFAULT_TEMPO_BPM`])
//! - `rms`: mean/std/min/max
//! - `spectral_flatness`: mean/std
//! - `tonnetz`: 6 dimension means then 6 stds
//!
//! Failure policy: apart from tempo, a group that cannot produce its declared number of finite
//! values fails the whole extraction with [`Error::Extraction`]. There are no placeholder
//! vectors, so a vector that leaves this module always has [`FEATURE_COUNT`] meaningful values.

use std::cell::OnceCell;

use anyhow::Result as AnyResult;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::audio_pipeline::TARGET_SAMPLE_RATE;
use crate::waveform::Waveform;
use crate::{Error, Result};

mod chroma;
mod hpss;
mod mel;
mod spectral;
mod stats;
mod stft;
mod tempo;
pub(crate) mod temporal;

/// FFT size of every spectral feature.
pub const N_FFT: usize = 2048;
/// Frame length of the time-domain features (RMS, zero crossings, silence trimming).
pub const FRAME_LENGTH: usize = 2048;
/// Hop between consecutive frames, shared by every framed feature.
pub const HOP_LENGTH: usize = 512;

const N_MFCC: usize = 13;
const N_MELS_MFCC: usize = 128;
const N_MELS_BANDS: usize = 13;

/// Tempo reported when no beat can be tracked.
pub const DEFAULT_TEMPO_BPM: f32 = 120.0;

/// Bumped whenever the group order, widths or algorithms change.
pub const FEATURE_LAYOUT_VERSION: u32 = 1;

struct Group {
    name: &'static str,
    width: usize,
    compute: fn(&Analysis) -> AnyResult<Vec<f32>>,
}

const GROUPS: &[Group] = &[
    Group {
        name: "mfcc",
        width: 4 * N_MFCC,
        compute: mfcc_group,
    },
    Group {
        name: "spectral_centroid",
        width: 4,
        compute: centroid_group,
    },
    Group {
        name: "spectral_rolloff",
        width: 4,
        compute: rolloff_group,
    },
    Group {
        name: "spectral_bandwidth",
        width: 4,
        compute: bandwidth_group,
    },
    Group {
        name: "spectral_contrast",
        width: 2 * (spectral::CONTRAST_BANDS + 1),
        compute: contrast_group,
    },
    Group {
        name: "zero_crossing_rate",
        width: 4,
        compute: zcr_group,
    },
    Group {
        name: "chroma",
        width: 2 * chroma::N_CHROMA,
        compute: chroma_group,
    },
    Group {
        name: "mel_bands",
        width: 2 * N_MELS_BANDS,
        compute: mel_bands_group,
    },
    Group {
        name: "hpss",
        width: 3,
        compute: hpss_group,
    },
    Group {
        name: "tempo",
        width: 1,
        compute: tempo_group,
    },
    Group {
        name: "rms",
        width: 4,
        compute: rms_group,
    },
    Group {
        name: "spectral_flatness",
        width: 2,
        compute: flatness_group,
    },
    Group {
        name: "tonnetz",
        width: 2 * chroma::N_TONNETZ,
        compute: tonnetz_group,
    },
];

const fn layout_width(groups: &[Group]) -> usize {
    let mut total = 0;
    let mut i = 0;
    while i < groups.len() {
        total += groups[i].width;
        i += 1;
    }
    total
}

/// Length of every feature vector.
pub const FEATURE_COUNT: usize = layout_width(GROUPS);

/// Names and widths of the feature groups, in vector order.
pub fn layout() -> impl Iterator<Item = (&'static str, usize)> {
    GROUPS.iter().map(|g| (g.name, g.width))
}

/// An ordered, fixed-length vector of acoustic features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(Vec<f32>);

impl FeatureVector {
    /// Wrap raw values (e.g. features loaded from disk). Width is checked by the scaler.
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }
}

/// Intermediates shared between groups, computed at most once per extraction.
struct Analysis<'a> {
    samples: &'a [f32],
    sample_rate: f32,
    magnitude: Array2<f32>,
    freqs: Vec<f32>,
    power: OnceCell<Array2<f32>>,
    mel_db: OnceCell<Array2<f32>>,
    hpss: OnceCell<hpss::Hpss>,
}

impl<'a> Analysis<'a> {
    fn new(samples: &'a [f32], sample_rate: u32) -> AnyResult<Self> {
        let sr = sample_rate as f32;
        Ok(Self {
            samples,
            sample_rate: sr,
            magnitude: stft::magnitude_spectrogram(samples, N_FFT, HOP_LENGTH)?,
            freqs: stft::fft_frequencies(sr, N_FFT),
            power: OnceCell::new(),
            mel_db: OnceCell::new(),
            hpss: OnceCell::new(),
        })
    }

    fn power(&self) -> &Array2<f32> {
        self.power.get_or_init(|| self.magnitude.mapv(|m| m * m))
    }

    /// 128-band mel power spectrogram in dB (0 dB == power 1).
    fn mel_db(&self) -> &Array2<f32> {
        self.mel_db.get_or_init(|| {
            let fb = mel::mel_filterbank(self.sample_rate, N_FFT, N_MELS_MFCC);
            mel::power_to_db(&fb.dot(self.power()), mel::DbRef::Unit)
        })
    }

    fn hpss(&self) -> &hpss::Hpss {
        self.hpss.get_or_init(|| hpss::separate(&self.magnitude))
    }
}

fn mfcc_group(a: &Analysis) -> AnyResult<Vec<f32>> {
    let coeffs = mel::mfcc(a.mel_db(), N_MFCC);
    Ok(stats::mean_std_min_max_rows(&coeffs))
}

fn centroid_group(a: &Analysis) -> AnyResult<Vec<f32>> {
    Ok(stats::mean_std_min_max(&spectral::centroid(&a.magnitude, &a.freqs)))
}

fn rolloff_group(a: &Analysis) -> AnyResult<Vec<f32>> {
    Ok(stats::mean_std_min_max(&spectral::rolloff(&a.magnitude, &a.freqs)))
}

fn bandwidth_group(a: &Analysis) -> AnyResult<Vec<f32>> {
    let centroids = spectral::centroid(&a.magnitude, &a.freqs);
    Ok(stats::mean_std_min_max(&spectral::bandwidth(
        &a.magnitude,
        &a.freqs,
        &centroids,
    )))
}

fn contrast_group(a: &Analysis) -> AnyResult<Vec<f32>> {
    Ok(stats::mean_std_rows(&spectral::contrast(&a.magnitude, &a.freqs)))
}

fn zcr_group(a: &Analysis) -> AnyResult<Vec<f32>> {
    let zcr = temporal::zero_crossing_rate(a.samples, FRAME_LENGTH, HOP_LENGTH);
    Ok(stats::mean_std_min_max(&zcr))
}

fn chroma_group(a: &Analysis) -> AnyResult<Vec<f32>> {
    let fb = chroma::chroma_filterbank(a.sample_rate, N_FFT);
    Ok(stats::mean_std_rows(&chroma::chroma(a.power(), &fb)))
}

fn mel_bands_group(a: &Analysis) -> AnyResult<Vec<f32>> {
    let fb = mel::mel_filterbank(a.sample_rate, N_FFT, N_MELS_BANDS);
    let db = mel::power_to_db(&fb.dot(a.power()), mel::DbRef::Max);
    Ok(stats::mean_std_rows(&db))
}

fn hpss_group(a: &Analysis) -> AnyResult<Vec<f32>> {
    Ok(a.hpss().ratios().to_vec())
}

fn tempo_group(a: &Analysis) -> AnyResult<Vec<f32>> {
    let onsets = tempo::onset_envelope(a.mel_db(), N_FFT, HOP_LENGTH);
    let bpm = tempo::estimate(&onsets, a.sample_rate, HOP_LENGTH);
    if bpm.is_none() {
        trace!("no trackable tempo, using default");
    }
    Ok(vec![bpm.unwrap_or(DEFAULT_TEMPO_BPM)])
}

fn rms_group(a: &Analysis) -> AnyResult<Vec<f32>> {
    let rms = temporal::frame_rms(a.samples, FRAME_LENGTH, HOP_LENGTH);
    Ok(stats::mean_std_min_max(&rms))
}

fn flatness_group(a: &Analysis) -> AnyResult<Vec<f32>> {
    Ok(stats::mean_std(&spectral::flatness(&a.magnitude)))
}

fn tonnetz_group(a: &Analysis) -> AnyResult<Vec<f32>> {
    let fb = chroma::chroma_filterbank(a.sample_rate, N_FFT);
    let harmonic_power = a.hpss().harmonic.mapv(|m| m * m);
    let tonal = chroma::tonnetz(&chroma::chroma(&harmonic_power, &fb));
    Ok(stats::mean_std_rows(&tonal))
}

/// Compute the [`FEATURE_COUNT`]-wide feature vector of a preprocessed waveform.
pub fn extract(waveform: &Waveform) -> Result<FeatureVector> {
    if waveform.sample_rate() != TARGET_SAMPLE_RATE {
        return Err(Error::extraction(
            "input",
            format!(
                "waveform is at {} Hz, expected {TARGET_SAMPLE_RATE} Hz",
                waveform.sample_rate()
            ),
        ));
    }
    if waveform.is_empty() {
        return Err(Error::extraction("input", "waveform is empty"));
    }

    let analysis = Analysis::new(waveform.samples(), waveform.sample_rate())
        .map_err(|e| Error::extraction("stft", format!("{e:#}")))?;

    let mut values = Vec::with_capacity(FEATURE_COUNT);
    for group in GROUPS {
        let out = (group.compute)(&analysis).map_err(|e| Error::extraction(group.name, format!("{e:#}")))?;

        if out.len() != group.width {
            return Err(Error::extraction(
                group.name,
                format!("produced {} values, expected {}", out.len(), group.width),
            ));
        }
        if let Some(i) = out.iter().position(|v| !v.is_finite()) {
            return Err(Error::extraction(
                group.name,
                format!("value {i} is not finite ({})", out[i]),
            ));
        }
        values.extend(out);
    }

    if values.len() != FEATURE_COUNT {
        return Err(Error::DimensionMismatch {
            expected: FEATURE_COUNT,
            actual: values.len(),
        });
    }

    trace!(frames = analysis.magnitude.ncols(), "extracted features");
    Ok(FeatureVector(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opts::Opts;
    use crate::waveform::preprocess;

    fn voiced(seconds: f32) -> Vec<f32> {
        let n = (seconds * TARGET_SAMPLE_RATE as f32) as usize;
        (0..n)
            .map(|i| {
                let t = i as f32 / TARGET_SAMPLE_RATE as f32;
                let env = 0.6 + 0.4 * (2.0 * std::f32::consts::PI * 3.0 * t).sin();
                env * ((2.0 * std::f32::consts::PI * 180.0 * t).sin()
                    + 0.5 * (2.0 * std::f32::consts::PI * 360.0 * t).sin())
            })
            .collect()
    }

    #[test]
    fn layout_adds_up_to_feature_count() {
        assert_eq!(FEATURE_COUNT, 154);
        assert_eq!(layout().map(|(_, w)| w).sum::<usize>(), FEATURE_COUNT);
        assert_eq!(layout().next(), Some(("mfcc", 52)));
    }

    #[test]
    fn vector_width_does_not_depend_on_duration() -> anyhow::Result<()> {
        for seconds in [0.5, 1.3, 4.0] {
            let wf = preprocess(voiced(seconds), TARGET_SAMPLE_RATE, &Opts::default())?;
            let fv = extract(&wf)?;
            assert_eq!(fv.len(), FEATURE_COUNT);
            assert!(fv.as_slice().iter().all(|v| v.is_finite()));
        }
        Ok(())
    }

    #[test]
    fn extraction_is_deterministic() -> anyhow::Result<()> {
        let wf = preprocess(voiced(2.0), TARGET_SAMPLE_RATE, &Opts::default())?;
        let a = extract(&wf)?;
        let b = extract(&wf)?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn hpss_ratios_are_fractions_of_the_total() -> anyhow::Result<()> {
        let wf = preprocess(voiced(2.0), TARGET_SAMPLE_RATE, &Opts::default())?;
        let fv = extract(&wf)?;
        let offset: usize = layout().take_while(|(n, _)| *n != "hpss").map(|(_, w)| w).sum();
        let h = fv.as_slice()[offset];
        let p = fv.as_slice()[offset + 1];
        assert!((0.0..=1.0).contains(&h));
        assert!((0.0..=1.0).contains(&p));
        assert!(h > p, "a steady voiced tone should be mostly harmonic");
        Ok(())
    }
}
