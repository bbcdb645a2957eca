//! Trained classifier artifacts and the ensemble that scores feature vectors with them.
//!
//! Every model family implements [`Classifier`] and is stored on disk as JSON tagged by a
//! `"kind"` field (see [`ModelArtifact`]). Artifacts are immutable once loaded; the registry
//! shares them across concurrent requests behind an `Arc`.

use serde::{Deserialize, Serialize};

use crate::Result;

pub mod calibration;
mod forest;
mod linear;
pub mod metadata;
pub mod registry;
pub mod scaler;
mod svm;
mod tree;

pub use calibration::{Calibrated, Platt};
pub use forest::{BoostingParams, ForestParams, GradientBoosting, RandomForest};
pub use linear::{LogisticParams, LogisticRegression};
pub use metadata::{ModelMetadata, ModelStats};
pub use registry::{Ensemble, EnsemblePredictions, ModelRegistry};
pub use scaler::StandardScaler;
pub use svm::{RbfSvm, SvmParams};
pub use tree::TreeParams;

/// Binary class of a voice sample. Training labels use `Real = 0`, `Fake = 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Real,
    Fake,
}

impl Label {
    pub fn from_target(target: u8) -> Self {
        if target == 0 { Self::Real } else { Self::Fake }
    }

    pub fn target(self) -> u8 {
        match self {
            Self::Real => 0,
            Self::Fake => 1,
        }
    }

    /// Verdict string used in analysis responses.
    pub fn verdict(self) -> &'static str {
        match self {
            Self::Real => "AUTHENTIC",
            Self::Fake => "CLONED",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Real => "real",
            Self::Fake => "fake",
        }
    }
}

/// Class probabilities reported by one model. `real + fake == 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Probabilities {
    pub real: f32,
    pub fake: f32,
}

impl Probabilities {
    pub fn from_fake(fake: f32) -> Self {
        let fake = fake.clamp(0.0, 1.0);
        Self {
            real: 1.0 - fake,
            fake,
        }
    }

    /// The more probable class; an exact tie reads as real.
    pub fn label(&self) -> Label {
        if self.fake > self.real {
            Label::Fake
        } else {
            Label::Real
        }
    }

    /// Probability of the chosen class on a 0–100 scale.
    pub fn confidence(&self) -> f32 {
        self.real.max(self.fake) * 100.0
    }

    pub fn is_finite(&self) -> bool {
        self.real.is_finite() && self.fake.is_finite()
    }
}

/// One model's output for one feature vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrediction {
    pub label: Label,
    pub probabilities: Probabilities,
}

impl ModelPrediction {
    pub fn from_probabilities(probabilities: Probabilities) -> Self {
        Self {
            label: probabilities.label(),
            probabilities,
        }
    }

    pub fn confidence(&self) -> f32 {
        self.probabilities.confidence()
    }
}

/// A fitted binary classifier over standardized feature vectors.
pub trait Classifier: Send + Sync {
    /// Number of features the model was fit on.
    fn input_width(&self) -> usize;

    /// Class probabilities for one standardized feature vector of width [`Self::input_width`].
    fn predict_proba(&self, x: &[f32]) -> Result<Probabilities>;
}

/// On-disk form of every supported model family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelArtifact {
    LogisticRegression(LogisticRegression),
    RandomForest(RandomForest),
    GradientBoosting(GradientBoosting),
    Svm(RbfSvm),
    /// Any other family wrapped with a fitted probability calibration.
    Calibrated(Calibrated),
}

impl ModelArtifact {
    pub fn classifier(&self) -> &dyn Classifier {
        match self {
            Self::LogisticRegression(m) => m,
            Self::RandomForest(m) => m,
            Self::GradientBoosting(m) => m,
            Self::Svm(m) => m,
            Self::Calibrated(m) => m,
        }
    }

    /// Structural checks run once at load time.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::LogisticRegression(m) => m.validate(),
            Self::RandomForest(m) => m.validate(),
            Self::GradientBoosting(m) => m.validate(),
            Self::Svm(m) => m.validate(),
            Self::Calibrated(m) => m.validate(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::LogisticRegression(_) => "logistic_regression",
            Self::RandomForest(_) => "random_forest",
            Self::GradientBoosting(_) => "gradient_boosting",
            Self::Svm(_) => "svm",
            Self::Calibrated(_) => "calibrated",
        }
    }
}

impl Classifier for ModelArtifact {
    fn input_width(&self) -> usize {
        self.classifier().input_width()
    }

    fn predict_proba(&self, x: &[f32]) -> Result<Probabilities> {
        self.classifier().predict_proba(x)
    }
}

pub(crate) fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ties_read_as_real() {
        let p = Probabilities::from_fake(0.5);
        assert_eq!(p.label(), Label::Real);
        assert_eq!(p.confidence(), 50.0);
    }

    #[test]
    fn confidence_uses_the_winning_class() {
        let p = Probabilities::from_fake(0.8);
        assert_eq!(p.label(), Label::Fake);
        assert!((p.confidence() - 80.0).abs() < 1e-4);
        assert_eq!(Label::Fake.verdict(), "CLONED");
        assert_eq!(Label::Real.verdict(), "AUTHENTIC");
    }

    #[test]
    fn sigmoid_is_stable_at_extremes() {
        assert_eq!(sigmoid(0.0), 0.5);
        assert!(sigmoid(1000.0) <= 1.0);
        assert!(sigmoid(-1000.0) >= 0.0);
        assert!(sigmoid(-1000.0).is_finite());
    }

    #[test]
    fn artifacts_are_tagged_by_kind() -> anyhow::Result<()> {
        let m = ModelArtifact::LogisticRegression(LogisticRegression::new(vec![0.5, -0.5], 0.1));
        let json = serde_json::to_value(&m)?;
        assert_eq!(json["kind"], "logistic_regression");
        let back: ModelArtifact = serde_json::from_value(json)?;
        assert_eq!(back.kind(), "logistic_regression");
        assert_eq!(back.input_width(), 2);
        Ok(())
    }
}
