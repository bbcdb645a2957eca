//! Tree ensembles: bagged classification forests and log-loss gradient boosting.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::tree::{Grower, Tree, TreeParams, check_training_set};
use super::{Classifier, Probabilities, sigmoid};
use crate::{Error, Result};

/// Bootstrap-aggregated trees whose leaves hold the fraction of fake samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    width: usize,
    trees: Vec<Tree>,
}

#[derive(Debug, Clone, Copy)]
pub struct ForestParams {
    pub n_trees: usize,
    pub tree: TreeParams,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            tree: TreeParams {
                max_depth: 12,
                min_samples_split: 2,
                min_samples_leaf: 1,
                max_features: None,
            },
            seed: 42,
        }
    }
}

fn check_trees(width: usize, trees: &[Tree]) -> Result<()> {
    if trees.is_empty() {
        return Err(Error::init("ensemble has no trees"));
    }
    trees.iter().try_for_each(|t| t.validate(width))
}

fn check_width(expected: usize, x: &[f32]) -> Result<()> {
    if x.len() != expected {
        return Err(Error::DimensionMismatch {
            expected,
            actual: x.len(),
        });
    }
    Ok(())
}

impl RandomForest {
    /// Fit on standardized rows with binary targets (0 = real, 1 = fake).
    ///
    /// Each tree sees a bootstrap sample and `√width` candidate features per split unless
    /// `params.tree.max_features` says otherwise.
    pub fn fit(rows: &[Vec<f32>], targets: &[u8], params: ForestParams) -> Result<Self> {
        let width = check_training_set(rows, targets)?;
        let y: Vec<f64> = targets.iter().map(|&t| t as f64).collect();
        let leaf = |idx: &[usize]| idx.iter().map(|&i| y[i]).sum::<f64>() / idx.len().max(1) as f64;

        let mut tree_params = params.tree;
        if tree_params.max_features.is_none() {
            tree_params.max_features = Some(((width as f64).sqrt().round() as usize).max(1));
        }

        let mut rng = StdRng::seed_from_u64(params.seed);
        let n = rows.len();
        let trees: Vec<Tree> = (0..params.n_trees.max(1))
            .map(|_| {
                let bootstrap: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                Grower::new(rows, &y, tree_params, &mut rng, &leaf).grow(bootstrap)
            })
            .collect();

        debug!(
            trees = trees.len(),
            max_depth = trees.iter().map(Tree::depth).max().unwrap_or(0),
            "fitted random forest"
        );
        Ok(Self { width, trees })
    }

    pub fn validate(&self) -> Result<()> {
        check_trees(self.width, &self.trees)
    }
}

impl Classifier for RandomForest {
    fn input_width(&self) -> usize {
        self.width
    }

    fn predict_proba(&self, x: &[f32]) -> Result<Probabilities> {
        check_width(self.width, x)?;
        let sum: f64 = self.trees.iter().map(|t| t.predict(x) as f64).sum();
        Ok(Probabilities::from_fake((sum / self.trees.len().max(1) as f64) as f32))
    }
}

/// Additive trees on the log-odds scale: `p(fake) = σ(base + lr · Σ tree(x))`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoosting {
    width: usize,
    base_score: f32,
    learning_rate: f32,
    trees: Vec<Tree>,
}

#[derive(Debug, Clone, Copy)]
pub struct BoostingParams {
    pub n_rounds: usize,
    pub learning_rate: f64,
    pub tree: TreeParams,
    pub seed: u64,
}

impl Default for BoostingParams {
    fn default() -> Self {
        Self {
            n_rounds: 100,
            learning_rate: 0.1,
            tree: TreeParams {
                max_depth: 3,
                min_samples_split: 4,
                min_samples_leaf: 2,
                max_features: None,
            },
            seed: 42,
        }
    }
}

impl GradientBoosting {
    /// Fit by Newton boosting on the binomial log loss.
    ///
    /// Each round fits a tree to the residuals `y - p`; the leaf value is the Newton step
    /// `Σ(y - p) / Σ p(1 - p)` over the rows that reach it.
    pub fn fit(rows: &[Vec<f32>], targets: &[u8], params: BoostingParams) -> Result<Self> {
        let width = check_training_set(rows, targets)?;
        let n = rows.len();
        let y: Vec<f64> = targets.iter().map(|&t| t as f64).collect();

        let prior = (y.iter().sum::<f64>() / n as f64).clamp(1e-6, 1.0 - 1e-6);
        let base = (prior / (1.0 - prior)).ln();
        let mut raw = vec![base; n];

        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut trees = Vec::with_capacity(params.n_rounds);
        for _ in 0..params.n_rounds {
            let p: Vec<f64> = raw.iter().map(|&r| sigmoid(r)).collect();
            let residual: Vec<f64> = y.iter().zip(&p).map(|(&yi, &pi)| yi - pi).collect();

            let leaf = |idx: &[usize]| {
                let num: f64 = idx.iter().map(|&i| residual[i]).sum();
                let den: f64 = idx.iter().map(|&i| p[i] * (1.0 - p[i])).sum();
                if den.abs() < 1e-12 { 0.0 } else { num / den }
            };
            let tree = Grower::new(rows, &residual, params.tree, &mut rng, &leaf).grow((0..n).collect());

            for (r, row) in raw.iter_mut().zip(rows) {
                *r += params.learning_rate * tree.predict(row) as f64;
            }
            trees.push(tree);
        }

        debug!(rounds = trees.len(), "fitted gradient boosting");
        Ok(Self {
            width,
            base_score: base as f32,
            learning_rate: params.learning_rate as f32,
            trees,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !self.base_score.is_finite() || !self.learning_rate.is_finite() {
            return Err(Error::init("boosting parameters are not finite"));
        }
        check_trees(self.width, &self.trees)
    }
}

impl Classifier for GradientBoosting {
    fn input_width(&self) -> usize {
        self.width
    }

    fn predict_proba(&self, x: &[f32]) -> Result<Probabilities> {
        check_width(self.width, x)?;
        let raw = self.base_score as f64
            + self.learning_rate as f64
                * self.trees.iter().map(|t| t.predict(x) as f64).sum::<f64>();
        Ok(Probabilities::from_fake(sigmoid(raw) as f32))
    }
}
