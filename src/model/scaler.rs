use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Per-feature standardization: `(x - mean) / scale`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f32>,
    pub scale: Vec<f32>,
}

impl StandardScaler {
    /// Fit means and population standard deviations column-wise over `rows`.
    ///
    /// Constant columns get a scale of 1.0 so they map to zero instead of NaN.
    pub fn fit(rows: &[Vec<f32>]) -> Result<Self> {
        let Some(first) = rows.first() else {
            return Err(Error::InvalidInput("cannot fit a scaler on zero rows".into()));
        };
        let width = first.len();
        if let Some(bad) = rows.iter().find(|r| r.len() != width) {
            return Err(Error::DimensionMismatch {
                expected: width,
                actual: bad.len(),
            });
        }

        let n = rows.len() as f64;
        let mut mean = vec![0.0_f64; width];
        for row in rows {
            for (m, &v) in mean.iter_mut().zip(row) {
                *m += v as f64;
            }
        }
        mean.iter_mut().for_each(|m| *m /= n);

        let mut var = vec![0.0_f64; width];
        for row in rows {
            for ((acc, &v), &m) in var.iter_mut().zip(row).zip(&mean) {
                *acc += (v as f64 - m).powi(2);
            }
        }

        let scale = var
            .iter()
            .map(|v| {
                let s = (v / n).sqrt();
                if s > 0.0 { s as f32 } else { 1.0 }
            })
            .collect();

        Ok(Self {
            mean: mean.into_iter().map(|m| m as f32).collect(),
            scale,
        })
    }

    pub fn width(&self) -> usize {
        self.mean.len()
    }

    /// Check that the parameters are usable (equal lengths, finite values).
    pub fn validate(&self) -> Result<()> {
        if self.mean.len() != self.scale.len() {
            return Err(Error::init(format!(
                "scaler has {} means but {} scales",
                self.mean.len(),
                self.scale.len()
            )));
        }
        if self
            .mean
            .iter()
            .chain(&self.scale)
            .any(|v| !v.is_finite())
        {
            return Err(Error::init("scaler contains non-finite parameters"));
        }
        Ok(())
    }

    pub fn transform(&self, x: &[f32]) -> Result<Vec<f32>> {
        if x.len() != self.width() {
            return Err(Error::DimensionMismatch {
                expected: self.width(),
                actual: x.len(),
            });
        }

        Ok(x.iter()
            .zip(&self.mean)
            .zip(&self.scale)
            .map(|((&v, &m), &s)| {
                let s = if s == 0.0 { 1.0 } else { s };
                (v - m) / s
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_then_transform_centers_columns() -> anyhow::Result<()> {
        let rows = vec![vec![1.0, 5.0], vec![3.0, 5.0]];
        let scaler = StandardScaler::fit(&rows)?;
        assert_eq!(scaler.mean, vec![2.0, 5.0]);
        assert_eq!(scaler.scale, vec![1.0, 1.0]);
        assert_eq!(scaler.transform(&[3.0, 5.0])?, vec![1.0, 0.0]);
        Ok(())
    }

    #[test]
    fn zero_scale_is_treated_as_one() -> anyhow::Result<()> {
        let scaler = StandardScaler {
            mean: vec![1.0],
            scale: vec![0.0],
        };
        assert_eq!(scaler.transform(&[4.0])?, vec![3.0]);
        Ok(())
    }

    #[test]
    fn width_mismatch_is_a_dimension_error() {
        let scaler = StandardScaler {
            mean: vec![0.0; 3],
            scale: vec![1.0; 3],
        };
        let err = scaler.transform(&[1.0, 2.0]).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }
}
