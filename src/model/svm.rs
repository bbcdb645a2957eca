use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::calibration::Platt;
use super::{Classifier, Probabilities, sigmoid};
use crate::{Error, Result};

/// Dual coefficients at or below this are not support vectors.
const SUPPORT_EPS: f64 = 1e-8;

/// Kernel SVM with an RBF kernel and Platt-scaled probabilities.
///
/// Decision value: `f(x) = Σ αᵢ·exp(-γ‖svᵢ - x‖²) + b`; probability of fake:
/// `1 / (1 + exp(A·f + B))`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RbfSvm {
    pub support_vectors: Vec<Vec<f32>>,
    pub dual_coef: Vec<f32>,
    pub intercept: f32,
    pub gamma: f32,
    pub platt_a: f32,
    pub platt_b: f32,
}

/// Soft-margin SMO settings for [`RbfSvm::fit`].
#[derive(Debug, Clone, Copy)]
pub struct SvmParams {
    /// Box constraint on the dual coefficients.
    pub c: f64,
    /// Kernel width; `None` uses `1 / (width · var(X))`.
    pub gamma: Option<f64>,
    /// KKT violation tolerance.
    pub tolerance: f64,
    /// Consecutive passes without an update before stopping.
    pub max_passes: usize,
    /// Hard cap on passes over the training set.
    pub max_iterations: usize,
    pub seed: u64,
}

impl Default for SvmParams {
    fn default() -> Self {
        Self {
            c: 1.0,
            gamma: None,
            tolerance: 1e-3,
            max_passes: 5,
            max_iterations: 200,
            seed: 42,
        }
    }
}

impl RbfSvm {
    /// Fit on standardized rows with binary targets (0 = real, 1 = fake) by simplified SMO.
    ///
    /// Probabilities start as `σ(f)`; pass held-out decision values to [`Platt::fit`] and
    /// [`RbfSvm::set_calibration`] to calibrate them.
    pub fn fit(rows: &[Vec<f32>], targets: &[u8], params: SvmParams) -> Result<Self> {
        let width = super::tree::check_training_set(rows, targets)?;
        if !targets.contains(&0) || !targets.contains(&1) {
            return Err(Error::InvalidInput("svm training needs both classes".into()));
        }
        if !params.c.is_finite() || params.c <= 0.0 {
            return Err(Error::InvalidInput("svm C must be positive".into()));
        }
        let gamma = params.gamma.unwrap_or_else(|| scale_gamma(rows, width));
        if !gamma.is_finite() || gamma <= 0.0 {
            return Err(Error::InvalidInput("svm gamma must be positive".into()));
        }

        let n = rows.len();
        let y: Vec<f64> = targets.iter().map(|&t| if t == 1 { 1.0 } else { -1.0 }).collect();
        let mut kernel = vec![0.0_f64; n * n];
        for i in 0..n {
            for j in i..n {
                let k = rbf(&rows[i], &rows[j], gamma);
                kernel[i * n + j] = k;
                kernel[j * n + i] = k;
            }
        }
        let k = |i: usize, j: usize| kernel[i * n + j];

        let mut alpha = vec![0.0_f64; n];
        let mut b = 0.0_f64;
        let margin = |alpha: &[f64], b: f64, i: usize| -> f64 {
            (0..n).map(|j| alpha[j] * y[j] * k(j, i)).sum::<f64>() + b - y[i]
        };

        let mut rng = StdRng::seed_from_u64(params.seed);
        let (mut passes, mut iterations) = (0, 0);
        while passes < params.max_passes && iterations < params.max_iterations {
            let mut changed = 0;
            for i in 0..n {
                let e_i = margin(&alpha, b, i);
                let violates = (y[i] * e_i < -params.tolerance && alpha[i] < params.c)
                    || (y[i] * e_i > params.tolerance && alpha[i] > 0.0);
                if !violates {
                    continue;
                }
                let mut j = rng.gen_range(0..n - 1);
                if j >= i {
                    j += 1;
                }
                let e_j = margin(&alpha, b, j);
                let (ai_old, aj_old) = (alpha[i], alpha[j]);

                let (lo, hi) = if y[i] != y[j] {
                    ((aj_old - ai_old).max(0.0), (params.c + aj_old - ai_old).min(params.c))
                } else {
                    ((ai_old + aj_old - params.c).max(0.0), (ai_old + aj_old).min(params.c))
                };
                if lo >= hi {
                    continue;
                }
                let eta = 2.0 * k(i, j) - k(i, i) - k(j, j);
                if eta >= 0.0 {
                    continue;
                }

                let aj = (aj_old - y[j] * (e_i - e_j) / eta).clamp(lo, hi);
                if (aj - aj_old).abs() < 1e-5 {
                    continue;
                }
                let ai = ai_old + y[i] * y[j] * (aj_old - aj);
                let (di, dj) = (y[i] * (ai - ai_old), y[j] * (aj - aj_old));
                let b1 = b - e_i - di * k(i, i) - dj * k(i, j);
                let b2 = b - e_j - di * k(i, j) - dj * k(j, j);
                b = if ai > 0.0 && ai < params.c {
                    b1
                } else if aj > 0.0 && aj < params.c {
                    b2
                } else {
                    (b1 + b2) / 2.0
                };
                alpha[i] = ai;
                alpha[j] = aj;
                changed += 1;
            }
            iterations += 1;
            passes = if changed == 0 { passes + 1 } else { 0 };
        }

        let (support_vectors, dual_coef): (Vec<Vec<f32>>, Vec<f32>) = alpha
            .iter()
            .zip(&y)
            .zip(rows)
            .filter(|((a, _), _)| **a > SUPPORT_EPS)
            .map(|((a, yi), row)| (row.clone(), (a * yi) as f32))
            .unzip();
        if support_vectors.is_empty() {
            return Err(Error::Other("svm training found no support vectors".into()));
        }
        if !b.is_finite() {
            return Err(Error::Other("svm training diverged".into()));
        }
        debug!(
            width,
            support_vectors = support_vectors.len(),
            iterations,
            gamma,
            "fitted rbf svm"
        );

        Ok(Self {
            support_vectors,
            dual_coef,
            intercept: b as f32,
            gamma: gamma as f32,
            platt_a: -1.0,
            platt_b: 0.0,
        })
    }

    /// Use `platt` to turn decision values into probabilities.
    pub fn set_calibration(&mut self, platt: Platt) {
        self.platt_a = platt.a;
        self.platt_b = platt.b;
    }

    pub fn validate(&self) -> Result<()> {
        let Some(first) = self.support_vectors.first() else {
            return Err(Error::init("svm has no support vectors"));
        };
        if self.dual_coef.len() != self.support_vectors.len() {
            return Err(Error::init(format!(
                "svm has {} coefficients for {} support vectors",
                self.dual_coef.len(),
                self.support_vectors.len()
            )));
        }
        if self.support_vectors.iter().any(|sv| sv.len() != first.len()) {
            return Err(Error::init("svm support vectors have mixed widths"));
        }
        if !self.gamma.is_finite() || self.gamma <= 0.0 {
            return Err(Error::init("svm gamma must be positive"));
        }
        if !self.intercept.is_finite() || !self.platt_a.is_finite() || !self.platt_b.is_finite() {
            return Err(Error::init("svm has non-finite parameters"));
        }
        Ok(())
    }

    pub fn decision_function(&self, x: &[f32]) -> f64 {
        let gamma = self.gamma as f64;
        self.support_vectors
            .iter()
            .zip(&self.dual_coef)
            .map(|(sv, &alpha)| alpha as f64 * rbf(sv, x, gamma))
            .sum::<f64>()
            + self.intercept as f64
    }
}

fn rbf(a: &[f32], b: &[f32], gamma: f64) -> f64 {
    let dist: f64 = a
        .iter()
        .zip(b)
        .map(|(&u, &v)| (u as f64 - v as f64).powi(2))
        .sum();
    (-gamma * dist).exp()
}

/// `1 / (width · var)` over every value in `rows`; 1 / width when the rows are constant.
fn scale_gamma(rows: &[Vec<f32>], width: usize) -> f64 {
    let count = (rows.len() * width) as f64;
    let mean = rows.iter().flatten().map(|&v| v as f64).sum::<f64>() / count;
    let var = rows
        .iter()
        .flatten()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        / count;
    if var > 0.0 {
        1.0 / (width as f64 * var)
    } else {
        1.0 / width as f64
    }
}

impl Classifier for RbfSvm {
    fn input_width(&self) -> usize {
        self.support_vectors.first().map_or(0, Vec::len)
    }

    fn predict_proba(&self, x: &[f32]) -> Result<Probabilities> {
        if x.len() != self.input_width() {
            return Err(Error::DimensionMismatch {
                expected: self.input_width(),
                actual: x.len(),
            });
        }
        let f = self.decision_function(x);
        let fake = sigmoid(-(self.platt_a as f64 * f + self.platt_b as f64));
        Ok(Probabilities::from_fake(fake as f32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_vector_svm() -> RbfSvm {
        RbfSvm {
            support_vectors: vec![vec![1.0, 0.0], vec![-1.0, 0.0]],
            dual_coef: vec![1.0, -1.0],
            intercept: 0.0,
            gamma: 1.0,
            platt_a: -4.0,
            platt_b: 0.0,
        }
    }

    #[test]
    fn near_the_positive_vector_is_fake() -> anyhow::Result<()> {
        let svm = two_vector_svm();
        svm.validate()?;
        assert!(svm.predict_proba(&[1.0, 0.0])?.fake > 0.9);
        assert!(svm.predict_proba(&[-1.0, 0.0])?.real > 0.9);
        assert_eq!(svm.predict_proba(&[0.0, 3.0])?.fake, 0.5);
        Ok(())
    }

    #[test]
    fn smo_separates_two_rings() -> anyhow::Result<()> {
        // Inner disc is real, outer ring is fake: no linear boundary exists.
        let mut rows = Vec::new();
        let mut targets = Vec::new();
        for i in 0..24 {
            let angle = i as f32 * std::f32::consts::TAU / 24.0;
            rows.push(vec![0.3 * angle.cos(), 0.3 * angle.sin()]);
            targets.push(0);
            rows.push(vec![2.0 * angle.cos(), 2.0 * angle.sin()]);
            targets.push(1);
        }
        let svm = RbfSvm::fit(
            &rows,
            &targets,
            SvmParams {
                c: 10.0,
                ..SvmParams::default()
            },
        )?;
        svm.validate()?;
        assert!(svm.support_vectors.len() <= rows.len());
        assert!(svm.decision_function(&[0.0, 0.0]) < 0.0);
        assert!(svm.decision_function(&[0.0, 2.1]) > 0.0);
        assert_eq!(svm.predict_proba(&[0.1, -0.1])?.label(), crate::model::Label::Real);
        assert_eq!(svm.predict_proba(&[-1.9, 0.2])?.label(), crate::model::Label::Fake);
        Ok(())
    }

    #[test]
    fn fitting_is_deterministic_for_a_seed() -> anyhow::Result<()> {
        let rows: Vec<Vec<f32>> = (0..20).map(|i| vec![i as f32 / 5.0 - 2.0, 0.5]).collect();
        let targets: Vec<u8> = rows.iter().map(|r| u8::from(r[0] > 0.0)).collect();
        let a = RbfSvm::fit(&rows, &targets, SvmParams::default())?;
        let b = RbfSvm::fit(&rows, &targets, SvmParams::default())?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn one_class_cannot_be_fit() {
        let rows = vec![vec![0.0, 1.0]; 4];
        assert!(RbfSvm::fit(&rows, &[1, 1, 1, 1], SvmParams::default()).is_err());
    }

    #[test]
    fn calibration_replaces_the_default_sigmoid() {
        let mut svm = two_vector_svm();
        svm.set_calibration(Platt { a: -1.0, b: 2.0 });
        assert_eq!((svm.platt_a, svm.platt_b), (-1.0, 2.0));
        // At the boundary the offset now favours real.
        assert!(svm.predict_proba(&[0.0, 3.0]).is_ok_and(|p| p.real > 0.8));
    }

    #[test]
    fn validate_catches_coefficient_mismatch() {
        let mut svm = two_vector_svm();
        svm.dual_coef.pop();
        assert!(svm.validate().is_err());
    }
}
