//! Platt scaling: a two-parameter sigmoid fitted on held-out scores.
//!
//! `p(fake | s) = 1 / (1 + exp(a·s + b))`. The fit minimizes the log-loss against smoothed
//! targets with a Newton method and backtracking line search, so a tiny calibration fold
//! cannot drive the probabilities to exactly 0 or 1.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Classifier, ModelArtifact, Probabilities, sigmoid};
use crate::{Error, Result};

const MAX_ITERATIONS: usize = 100;
const MIN_STEP: f64 = 1e-10;
const HESSIAN_RIDGE: f64 = 1e-12;
const GRADIENT_EPS: f64 = 1e-5;

/// Sigmoid parameters; `a` is negative when higher scores mean fake.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Platt {
    pub a: f32,
    pub b: f32,
}

impl Platt {
    /// Fit on `scores` (any monotone "fakeness" score) and binary targets.
    ///
    /// Fails when either class is missing or when the fitted map would decrease with the
    /// score, since that would invert the base model's ranking.
    pub fn fit(scores: &[f64], targets: &[u8]) -> Result<Self> {
        if scores.len() != targets.len() {
            return Err(Error::InvalidInput(format!(
                "{} scores but {} targets",
                scores.len(),
                targets.len()
            )));
        }
        let fakes = targets.iter().filter(|&&t| t == 1).count() as f64;
        let reals = targets.len() as f64 - fakes;
        if fakes == 0.0 || reals == 0.0 {
            return Err(Error::InvalidInput(
                "calibration needs both classes in the held-out fold".into(),
            ));
        }

        let hi = (fakes + 1.0) / (fakes + 2.0);
        let lo = 1.0 / (reals + 2.0);
        let smoothed: Vec<f64> = targets.iter().map(|&t| if t == 1 { hi } else { lo }).collect();

        let mut a = 0.0_f64;
        let mut b = ((reals + 1.0) / (fakes + 1.0)).ln();
        let mut loss = log_loss(scores, &smoothed, a, b);

        for iteration in 0..MAX_ITERATIONS {
            let (mut h11, mut h22, mut h21) = (HESSIAN_RIDGE, HESSIAN_RIDGE, 0.0);
            let (mut g1, mut g2) = (0.0, 0.0);
            for (&s, &t) in scores.iter().zip(&smoothed) {
                let p = sigmoid(-(a * s + b));
                let d2 = p * (1.0 - p);
                h11 += s * s * d2;
                h22 += d2;
                h21 += s * d2;
                let d1 = t - p;
                g1 += s * d1;
                g2 += d1;
            }
            if g1.abs() < GRADIENT_EPS && g2.abs() < GRADIENT_EPS {
                debug!(iteration, "platt fit converged");
                break;
            }

            let det = h11 * h22 - h21 * h21;
            let da = -(h22 * g1 - h21 * g2) / det;
            let db = -(-h21 * g1 + h11 * g2) / det;
            let slope = g1 * da + g2 * db;

            let mut step = 1.0;
            while step >= MIN_STEP {
                let (na, nb) = (a + step * da, b + step * db);
                let candidate = log_loss(scores, &smoothed, na, nb);
                if candidate < loss + 1e-4 * step * slope {
                    (a, b, loss) = (na, nb, candidate);
                    break;
                }
                step /= 2.0;
            }
            if step < MIN_STEP {
                debug!(iteration, "platt line search stalled");
                break;
            }
        }

        if !a.is_finite() || !b.is_finite() {
            return Err(Error::Other("platt calibration diverged".into()));
        }
        if a >= 0.0 {
            return Err(Error::Other(
                "held-out scores do not increase with the fake class".into(),
            ));
        }
        Ok(Self {
            a: a as f32,
            b: b as f32,
        })
    }

    /// Calibrated probability of fake for `score`.
    pub fn apply(&self, score: f64) -> f64 {
        sigmoid(-(self.a as f64 * score + self.b as f64))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.a.is_finite() || !self.b.is_finite() {
            return Err(Error::init("calibration has non-finite parameters"));
        }
        Ok(())
    }
}

fn log_loss(scores: &[f64], smoothed: &[f64], a: f64, b: f64) -> f64 {
    scores
        .iter()
        .zip(smoothed)
        .map(|(&s, &t)| {
            let z = a * s + b;
            // Both branches equal t·z + ln(1 + e^-z), arranged to avoid overflow.
            if z >= 0.0 {
                t * z + (-z).exp().ln_1p()
            } else {
                (t - 1.0) * z + z.exp().ln_1p()
            }
        })
        .sum()
}

/// A model whose probability of fake is remapped by [`Platt`] scaling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calibrated {
    pub calibration: Platt,
    pub base: Box<ModelArtifact>,
}

impl Calibrated {
    pub fn validate(&self) -> Result<()> {
        if matches!(*self.base, ModelArtifact::Calibrated(_)) {
            return Err(Error::init("calibrated models cannot be nested"));
        }
        self.calibration.validate()?;
        self.base.validate()
    }
}

impl Classifier for Calibrated {
    fn input_width(&self) -> usize {
        self.base.input_width()
    }

    fn predict_proba(&self, x: &[f32]) -> Result<Probabilities> {
        let raw = self.base.predict_proba(x)?;
        Ok(Probabilities::from_fake(
            self.calibration.apply(raw.fake as f64) as f32,
        ))
    }
}
