//! Summary statistics used to flatten time series into fixed-width feature groups.
//!
//! Layout convention: a group with `n` rows and statistics `[mean, std]` is written as all `n`
//! means followed by all `n` standard deviations (not interleaved per row).

use ndarray::Array2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Summary {
    pub mean: f32,
    pub std: f32,
    pub min: f32,
    pub max: f32,
}

/// Population statistics (ddof = 0), accumulated in `f64`.
///
/// An empty series yields NaN everywhere; the extractor's finiteness check rejects it.
pub(crate) fn summarize(values: impl IntoIterator<Item = f32>) -> Summary {
    let mut n = 0usize;
    let mut sum = 0.0_f64;
    let mut sum_sq = 0.0_f64;
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;

    for v in values {
        n += 1;
        sum += v as f64;
        sum_sq += (v as f64) * (v as f64);
        min = min.min(v);
        max = max.max(v);
    }

    if n == 0 {
        return Summary {
            mean: f32::NAN,
            std: f32::NAN,
            min: f32::NAN,
            max: f32::NAN,
        };
    }

    let mean = sum / n as f64;
    let var = (sum_sq / n as f64 - mean * mean).max(0.0);
    Summary {
        mean: mean as f32,
        std: var.sqrt() as f32,
        min,
        max,
    }
}

/// Per-row summaries of a `(rows, frames)` matrix.
pub(crate) fn row_summaries(m: &Array2<f32>) -> Vec<Summary> {
    m.rows().into_iter().map(|r| summarize(r.iter().copied())).collect()
}

/// Row means then row standard deviations.
pub(crate) fn mean_std_rows(m: &Array2<f32>) -> Vec<f32> {
    let s = row_summaries(m);
    s.iter().map(|x| x.mean).chain(s.iter().map(|x| x.std)).collect()
}

/// Row means, stds, mins, then maxes.
pub(crate) fn mean_std_min_max_rows(m: &Array2<f32>) -> Vec<f32> {
    let s = row_summaries(m);
    s.iter()
        .map(|x| x.mean)
        .chain(s.iter().map(|x| x.std))
        .chain(s.iter().map(|x| x.min))
        .chain(s.iter().map(|x| x.max))
        .collect()
}

/// `[mean, std, min, max]` of a single series.
pub(crate) fn mean_std_min_max(values: &[f32]) -> Vec<f32> {
    let s = summarize(values.iter().copied());
    vec![s.mean, s.std, s.min, s.max]
}

/// `[mean, std]` of a single series.
pub(crate) fn mean_std(values: &[f32]) -> Vec<f32> {
    let s = summarize(values.iter().copied());
    vec![s.mean, s.std]
}
