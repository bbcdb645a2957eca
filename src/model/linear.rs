use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Classifier, Probabilities, sigmoid};
use crate::{Error, Result};

/// L2-regularized logistic regression: `p(fake) = σ(w·x + b)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    pub weights: Vec<f32>,
    pub bias: f32,
}

/// Batch gradient descent settings for [`LogisticRegression::fit`].
#[derive(Debug, Clone, Copy)]
pub struct LogisticParams {
    pub learning_rate: f64,
    pub epochs: usize,
    /// L2 penalty strength (inverse of the usual `C`).
    pub l2: f64,
}

impl Default for LogisticParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            epochs: 500,
            l2: 1e-3,
        }
    }
}

impl LogisticRegression {
    pub fn new(weights: Vec<f32>, bias: f32) -> Self {
        Self { weights, bias }
    }

    pub fn validate(&self) -> Result<()> {
        if self.weights.is_empty() {
            return Err(Error::init("logistic regression has no weights"));
        }
        if !self.bias.is_finite() || self.weights.iter().any(|w| !w.is_finite()) {
            return Err(Error::init("logistic regression has non-finite parameters"));
        }
        Ok(())
    }

    fn logit(&self, x: &[f32]) -> f64 {
        self.weights
            .iter()
            .zip(x)
            .map(|(&w, &v)| w as f64 * v as f64)
            .sum::<f64>()
            + self.bias as f64
    }

    /// Fit on standardized rows with binary targets (0 = real, 1 = fake).
    pub fn fit(rows: &[Vec<f32>], targets: &[u8], params: LogisticParams) -> Result<Self> {
        let width = super::tree::check_training_set(rows, targets)?;
        let n = rows.len() as f64;

        let mut w = vec![0.0_f64; width];
        let mut b = 0.0_f64;
        let mut grad = vec![0.0_f64; width];

        for _ in 0..params.epochs {
            grad.fill(0.0);
            let mut grad_b = 0.0;
            for (row, &t) in rows.iter().zip(targets) {
                let z: f64 = w.iter().zip(row).map(|(&wi, &v)| wi * v as f64).sum::<f64>() + b;
                let err = sigmoid(z) - t as f64;
                for (g, &v) in grad.iter_mut().zip(row) {
                    *g += err * v as f64;
                }
                grad_b += err;
            }
            for (wi, g) in w.iter_mut().zip(&grad) {
                *wi -= params.learning_rate * (g / n + params.l2 * *wi);
            }
            b -= params.learning_rate * grad_b / n;
        }

        if w.iter().any(|v| !v.is_finite()) || !b.is_finite() {
            return Err(Error::Other("logistic regression diverged".into()));
        }
        debug!(width, epochs = params.epochs, "fitted logistic regression");

        Ok(Self {
            weights: w.into_iter().map(|v| v as f32).collect(),
            bias: b as f32,
        })
    }
}

impl Classifier for LogisticRegression {
    fn input_width(&self) -> usize {
        self.weights.len()
    }

    fn predict_proba(&self, x: &[f32]) -> Result<Probabilities> {
        if x.len() != self.weights.len() {
            return Err(Error::DimensionMismatch {
                expected: self.weights.len(),
                actual: x.len(),
            });
        }
        Ok(Probabilities::from_fake(sigmoid(self.logit(x)) as f32))
    }
}
