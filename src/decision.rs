//! Turning per-model predictions into one verdict.
//!
//! - The primary verdict comes from a single model: the configured best model, or the first
//!   available model in the priority list when the best one did not produce a prediction.
//! - The ensemble verdict is a plain majority vote across every model that predicted; an
//!   even split is resolved by [`TieBreak`] (real by default).

use serde::Serialize;

use crate::model::{EnsemblePredictions, Label, ModelMetadata, Probabilities};
use crate::opts::{Opts, TieBreak};
use crate::{Error, Result};

/// Fallback order used when neither the options nor the metadata provide one.
pub const BUILTIN_PRIORITY: [&str; 5] = [
    "xgboost",
    "gradient_boosting",
    "random_forest",
    "svm",
    "logistic_regression",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionPolicy {
    pub best_model: String,
    pub priority: Vec<String>,
    pub tie_break: TieBreak,
}

impl DecisionPolicy {
    /// Priority source, first non-empty wins: `opts.model_priority`, metadata
    /// `model_priority`, [`BUILTIN_PRIORITY`].
    pub fn new(metadata: &ModelMetadata, opts: &Opts) -> Self {
        let priority = if !opts.model_priority.is_empty() {
            opts.model_priority.clone()
        } else if !metadata.model_priority.is_empty() {
            metadata.model_priority.clone()
        } else {
            BUILTIN_PRIORITY.iter().map(|s| (*s).to_owned()).collect()
        };

        Self {
            best_model: metadata.best_model.clone(),
            priority,
            tie_break: opts.tie_break,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnsembleVerdict {
    pub label: Label,
    /// Highest per-model confidence (0–100).
    pub confidence: f32,
    pub fake_votes: usize,
    pub real_votes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    /// Model whose output is the primary verdict.
    pub primary_model: String,
    pub label: Label,
    /// Primary model's winning probability (0–100).
    pub confidence: f32,
    pub probabilities: Probabilities,
    pub ensemble: EnsembleVerdict,
}

fn pick_primary<'a>(predictions: &'a EnsemblePredictions, policy: &DecisionPolicy) -> Option<&'a str> {
    let available = |name: &String| {
        predictions
            .predictions
            .get_key_value(name)
            .map(|(k, _)| k.as_str())
    };

    available(&policy.best_model)
        .or_else(|| policy.priority.iter().find_map(available))
        // BTreeMap keys iterate in lexicographic order.
        .or_else(|| predictions.predictions.keys().next().map(String::as_str))
}

pub fn decide(predictions: &EnsemblePredictions, policy: &DecisionPolicy) -> Result<Decision> {
    let Some(primary_model) = pick_primary(predictions, policy) else {
        return Err(Error::prediction("ensemble", "all model predictions failed"));
    };
    let primary = predictions.predictions[primary_model];

    let fake_votes = predictions
        .predictions
        .values()
        .filter(|p| p.label == Label::Fake)
        .count();
    let real_votes = predictions.predictions.len() - fake_votes;

    let label = match fake_votes.cmp(&real_votes) {
        std::cmp::Ordering::Greater => Label::Fake,
        std::cmp::Ordering::Less => Label::Real,
        std::cmp::Ordering::Equal => match policy.tie_break {
            TieBreak::Real => Label::Real,
            TieBreak::Fake => Label::Fake,
        },
    };

    let confidence = predictions
        .predictions
        .values()
        .map(|p| p.confidence())
        .fold(0.0_f32, f32::max);

    Ok(Decision {
        primary_model: primary_model.to_owned(),
        label: primary.label,
        confidence: primary.confidence(),
        probabilities: primary.probabilities,
        ensemble: EnsembleVerdict {
            label,
            confidence,
            fake_votes,
            real_votes,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelPrediction;

    fn preds(entries: &[(&str, f32)]) -> EnsemblePredictions {
        let mut out = EnsemblePredictions::default();
        for (name, fake) in entries {
            out.predictions.insert(
                (*name).to_owned(),
                ModelPrediction::from_probabilities(Probabilities::from_fake(*fake)),
            );
        }
        out
    }

    fn policy(best: &str) -> DecisionPolicy {
        DecisionPolicy {
            best_model: best.to_owned(),
            priority: BUILTIN_PRIORITY.iter().map(|s| (*s).to_owned()).collect(),
            tie_break: TieBreak::Real,
        }
    }

    #[test]
    fn two_two_split_resolves_to_real() -> anyhow::Result<()> {
        let p = preds(&[("a", 0.9), ("b", 0.8), ("c", 0.2), ("d", 0.1)]);
        let d = decide(&p, &policy("a"))?;
        assert_eq!(d.ensemble.fake_votes, 2);
        assert_eq!(d.ensemble.real_votes, 2);
        assert_eq!(d.ensemble.label, Label::Real);
        // The primary still reports its own verdict.
        assert_eq!(d.label, Label::Fake);

        let fake_ties = DecisionPolicy {
            tie_break: TieBreak::Fake,
            ..policy("a")
        };
        assert_eq!(decide(&p, &fake_ties)?.ensemble.label, Label::Fake);
        Ok(())
    }

    #[test]
    fn missing_best_model_falls_back_through_priority() -> anyhow::Result<()> {
        let p = preds(&[("random_forest", 0.7), ("svm", 0.2), ("aaa", 0.1)]);
        let d = decide(&p, &policy("xgboost"))?;
        assert_eq!(d.primary_model, "random_forest");
        assert!((d.confidence - 70.0).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn unknown_names_fall_back_lexicographically() -> anyhow::Result<()> {
        let p = preds(&[("zeta", 0.7), ("alpha", 0.2)]);
        let d = decide(&p, &policy("xgboost"))?;
        assert_eq!(d.primary_model, "alpha");
        Ok(())
    }

    #[test]
    fn ensemble_confidence_is_the_highest_model_confidence() -> anyhow::Result<()> {
        let p = preds(&[("a", 0.6), ("b", 0.05)]);
        let d = decide(&p, &policy("a"))?;
        assert!((d.ensemble.confidence - 95.0).abs() < 1e-3);
        assert!((d.confidence - 60.0).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn no_predictions_is_an_error() {
        let err = decide(&EnsemblePredictions::default(), &policy("a")).unwrap_err();
        assert!(matches!(err, Error::Prediction { .. }));
        assert!(err.to_string().contains("all model predictions failed"));
    }

    #[test]
    fn options_priority_overrides_metadata() {
        let meta = ModelMetadata {
            best_model: "x".into(),
            models: Default::default(),
            training_date: String::new(),
            num_features: 0,
            sample_rate: 0,
            feature_layout_version: None,
            model_priority: vec!["m1".into()],
        };
        let opts = Opts {
            model_priority: vec!["o1".into()],
            ..Opts::default()
        };
        assert_eq!(DecisionPolicy::new(&meta, &opts).priority, vec!["o1"]);
        assert_eq!(DecisionPolicy::new(&meta, &Opts::default()).priority, vec!["m1"]);
    }
}
