//! Fitting the scaler and classifier families, and writing an artifact directory.
//!
//! Features come from [`crate::features::extract`], the same function the detector uses, so
//! trained models and live analysis always agree on the vector layout.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{info, warn};

use crate::audio_pipeline::TARGET_SAMPLE_RATE;
use crate::features::FEATURE_LAYOUT_VERSION;
use crate::model::registry::write_artifacts;
use crate::model::{
    BoostingParams, Calibrated, Classifier, ForestParams, GradientBoosting, LogisticParams,
    LogisticRegression, ModelArtifact, ModelMetadata, ModelStats, Platt, RandomForest, RbfSvm,
    StandardScaler, SvmParams,
};
use crate::{Error, Result};

mod dataset;
mod metrics;

pub use dataset::{Dataset, FAKE_DIR, REAL_DIR};
pub use metrics::{accuracy, roc_auc};

/// Classifier families the trainer can fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum Family {
    LogisticRegression,
    RandomForest,
    GradientBoosting,
    Svm,
}

impl Family {
    pub const ALL: [Family; 4] = [
        Family::LogisticRegression,
        Family::RandomForest,
        Family::GradientBoosting,
        Family::Svm,
    ];

    /// Ensemble member name, also the artifact file stem.
    pub fn name(self) -> &'static str {
        match self {
            Self::LogisticRegression => "logistic_regression",
            Self::RandomForest => "random_forest",
            Self::GradientBoosting => "gradient_boosting",
            Self::Svm => "svm",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainOpts {
    /// Fraction of each class held out for evaluation.
    pub holdout_fraction: f64,
    /// Fraction of each class of the training split kept aside to fit the Platt calibration.
    /// Zero fits on the whole training split and leaves probabilities uncalibrated.
    pub calibration_fraction: f64,
    pub seed: u64,
    pub families: Vec<Family>,
    pub logistic: LogisticParams,
    pub forest: ForestParams,
    pub boosting: BoostingParams,
    pub svm: SvmParams,
}

impl Default for TrainOpts {
    fn default() -> Self {
        Self {
            holdout_fraction: 0.2,
            calibration_fraction: 0.2,
            seed: 42,
            families: Family::ALL.to_vec(),
            logistic: LogisticParams::default(),
            forest: ForestParams::default(),
            boosting: BoostingParams::default(),
            svm: SvmParams::default(),
        }
    }
}

/// A fitted artifact set, ready to be written with [`TrainedSet::write`].
#[derive(Debug, Clone)]
pub struct TrainedSet {
    pub metadata: ModelMetadata,
    pub scaler: StandardScaler,
    pub models: BTreeMap<String, ModelArtifact>,
}

impl TrainedSet {
    pub fn write(&self, dir: impl AsRef<Path>) -> Result<()> {
        write_artifacts(
            dir,
            &self.metadata,
            &self.scaler,
            self.models.iter().map(|(name, m)| (name.as_str(), m)),
        )
    }
}

/// Row indices `(train, test)` with each class split by `fraction` independently.
///
/// A class with at least two rows always contributes one test row and keeps one for
/// training.
pub fn stratified_split(targets: &[u8], fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let (mut train, mut test) = (Vec::new(), Vec::new());
    for class in [0_u8, 1] {
        let mut idx: Vec<usize> = (0..targets.len()).filter(|&i| targets[i] == class).collect();
        idx.shuffle(&mut rng);
        let n_test = if idx.len() < 2 {
            0
        } else {
            ((idx.len() as f64 * fraction).ceil() as usize).clamp(1, idx.len() - 1)
        };
        test.extend_from_slice(&idx[..n_test]);
        train.extend_from_slice(&idx[n_test..]);
    }
    train.sort_unstable();
    test.sort_unstable();
    (train, test)
}

fn fit_family(
    family: Family,
    rows: &[Vec<f32>],
    targets: &[u8],
    opts: &TrainOpts,
) -> Result<ModelArtifact> {
    Ok(match family {
        Family::LogisticRegression => {
            ModelArtifact::LogisticRegression(LogisticRegression::fit(rows, targets, opts.logistic)?)
        }
        Family::RandomForest => {
            ModelArtifact::RandomForest(RandomForest::fit(rows, targets, opts.forest)?)
        }
        Family::GradientBoosting => {
            ModelArtifact::GradientBoosting(GradientBoosting::fit(rows, targets, opts.boosting)?)
        }
        Family::Svm => ModelArtifact::Svm(RbfSvm::fit(rows, targets, opts.svm)?),
    })
}

/// Fit Platt scaling on the calibration fold and attach it to `model`.
///
/// SVMs are calibrated on their decision values; other families on their own probability
/// of fake. A fold that cannot be calibrated (one class, or scores that do not rank fakes
/// higher) leaves the model as it is.
fn calibrate(model: ModelArtifact, rows: &[Vec<f32>], targets: &[u8]) -> Result<ModelArtifact> {
    let scores: Vec<f64> = match &model {
        ModelArtifact::Svm(svm) => rows.iter().map(|r| svm.decision_function(r)).collect(),
        other => rows
            .iter()
            .map(|r| other.predict_proba(r).map(|p| p.fake as f64))
            .collect::<Result<Vec<f64>>>()?,
    };
    let platt = match Platt::fit(&scores, targets) {
        Ok(platt) => platt,
        Err(e) => {
            warn!(kind = model.kind(), error = %e, "keeping uncalibrated probabilities");
            return Ok(model);
        }
    };
    Ok(match model {
        ModelArtifact::Svm(mut svm) => {
            svm.set_calibration(platt);
            ModelArtifact::Svm(svm)
        }
        base => ModelArtifact::Calibrated(Calibrated {
            calibration: platt,
            base: Box::new(base),
        }),
    })
}

fn evaluate(model: &ModelArtifact, rows: &[Vec<f32>], targets: &[u8]) -> Result<(f64, f64)> {
    let mut scores = Vec::with_capacity(rows.len());
    let mut predicted = Vec::with_capacity(rows.len());
    for row in rows {
        let p = model.predict_proba(row)?;
        scores.push(p.fake);
        predicted.push(p.label().target());
    }
    Ok((accuracy(targets, &predicted), roc_auc(targets, &scores)))
}

/// Fit the scaler on the training split, then every requested family, and evaluate each on
/// the hold-out split.
///
/// The best model is the one with the highest AUC, accuracy breaking ties (then name
/// order). The metadata's `model_priority` lists every model in that same ranking.
pub fn train(dataset: &Dataset, opts: &TrainOpts) -> Result<TrainedSet> {
    let (real, fake) = dataset.class_counts();
    if real < 2 || fake < 2 {
        return Err(Error::InvalidInput(format!(
            "need at least two samples per class, got {real} real and {fake} fake"
        )));
    }
    if opts.families.is_empty() {
        return Err(Error::InvalidInput("no model families selected".into()));
    }

    let (train_idx, test_idx) = stratified_split(&dataset.targets, opts.holdout_fraction, opts.seed);
    let pick = |idx: &[usize]| -> (Vec<Vec<f32>>, Vec<u8>) {
        (
            idx.iter().map(|&i| dataset.rows[i].clone()).collect(),
            idx.iter().map(|&i| dataset.targets[i]).collect(),
        )
    };
    let (train_rows, train_y) = pick(&train_idx);
    let (test_rows, test_y) = pick(&test_idx);

    let scaler = StandardScaler::fit(&train_rows)?;
    let scale_all = |rows: &[Vec<f32>]| -> Result<Vec<Vec<f32>>> {
        rows.iter().map(|r| scaler.transform(r)).collect()
    };
    let train_scaled = scale_all(&train_rows)?;
    let test_scaled = scale_all(&test_rows)?;

    // The calibration fold comes out of the training split so the hold-out stays untouched.
    let (fit_idx, cal_idx) = if opts.calibration_fraction > 0.0 {
        stratified_split(&train_y, opts.calibration_fraction, opts.seed.wrapping_add(1))
    } else {
        ((0..train_y.len()).collect(), Vec::new())
    };
    let fit_rows: Vec<Vec<f32>> = fit_idx.iter().map(|&i| train_scaled[i].clone()).collect();
    let fit_y: Vec<u8> = fit_idx.iter().map(|&i| train_y[i]).collect();
    let cal_rows: Vec<Vec<f32>> = cal_idx.iter().map(|&i| train_scaled[i].clone()).collect();
    let cal_y: Vec<u8> = cal_idx.iter().map(|&i| train_y[i]).collect();

    let mut models = BTreeMap::new();
    let mut stats = BTreeMap::new();
    for &family in &opts.families {
        let name = family.name();
        let started = Instant::now();
        let fitted = fit_family(family, &fit_rows, &fit_y, opts).and_then(|model| {
            let model = if cal_rows.is_empty() {
                model
            } else {
                calibrate(model, &cal_rows, &cal_y)?
            };
            let training_time = started.elapsed().as_secs_f64();
            let (accuracy, auc_score) = evaluate(&model, &test_scaled, &test_y)?;
            Ok((
                model,
                ModelStats {
                    accuracy,
                    auc_score,
                    training_time,
                },
            ))
        });
        match fitted {
            Ok((model, s)) => {
                info!(
                    model = name,
                    accuracy = s.accuracy,
                    auc = s.auc_score,
                    seconds = s.training_time,
                    "trained model"
                );
                models.insert(name.to_owned(), model);
                stats.insert(name.to_owned(), s);
            }
            Err(e) => warn!(model = name, error = %e, "training failed"),
        }
    }
    if models.is_empty() {
        return Err(Error::Other("every model family failed to train".into()));
    }

    let model_priority = rank(&stats);
    let best_model = model_priority[0].clone();
    info!(best_model = %best_model, "selected best model");

    Ok(TrainedSet {
        metadata: ModelMetadata {
            best_model,
            models: stats,
            training_date: utc_timestamp(Utc::now()),
            num_features: scaler.width(),
            sample_rate: TARGET_SAMPLE_RATE,
            feature_layout_version: Some(FEATURE_LAYOUT_VERSION),
            model_priority,
        },
        scaler,
        models,
    })
}

/// Model names ordered by AUC, then accuracy, best first; equal scores keep name order.
fn rank(stats: &BTreeMap<String, ModelStats>) -> Vec<String> {
    let mut names: Vec<&String> = stats.keys().collect();
    names.sort_by(|a, b| {
        let (sa, sb) = (&stats[*a], &stats[*b]);
        sb.auc_score
            .total_cmp(&sa.auc_score)
            .then(sb.accuracy.total_cmp(&sa.accuracy))
    });
    names.into_iter().cloned().collect()
}

/// `YYYY-MM-DDTHH:MM:SSZ` for `time`.
fn utc_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_is_stratified_and_disjoint() {
        let targets: Vec<u8> = [0; 10].into_iter().chain([1; 5]).collect();
        let (train, test) = stratified_split(&targets, 0.2, 1);
        assert_eq!(train.len() + test.len(), 15);
        assert_eq!(test.iter().filter(|&&i| targets[i] == 0).count(), 2);
        assert_eq!(test.iter().filter(|&&i| targets[i] == 1).count(), 1);
        assert!(test.iter().all(|i| !train.contains(i)));
    }

    #[test]
    fn ranking_prefers_auc_then_accuracy() {
        let s = |accuracy, auc_score| ModelStats {
            accuracy,
            auc_score,
            training_time: 0.0,
        };
        let stats = BTreeMap::from([
            ("a".to_owned(), s(0.9, 0.8)),
            ("b".to_owned(), s(0.7, 0.95)),
            ("c".to_owned(), s(0.95, 0.95)),
            ("d".to_owned(), s(0.9, 0.8)),
        ]);
        assert_eq!(rank(&stats), ["c", "b", "a", "d"]);
    }

    #[test]
    fn timestamps_are_utc_calendar_dates() -> anyhow::Result<()> {
        let leap = DateTime::<Utc>::from_timestamp(951_782_400 + 3_661, 0)
            .ok_or_else(|| anyhow::anyhow!("timestamp out of range"))?;
        assert_eq!(utc_timestamp(leap), "2000-02-29T01:01:01Z");
        assert_eq!(utc_timestamp(DateTime::<Utc>::UNIX_EPOCH), "1970-01-01T00:00:00Z");
        // Sub-second precision is dropped.
        let fractional = DateTime::<Utc>::from_timestamp(0, 999_000_000)
            .ok_or_else(|| anyhow::anyhow!("timestamp out of range"))?;
        assert_eq!(utc_timestamp(fractional), "1970-01-01T00:00:00Z");
        Ok(())
    }

    /// `n` rows alternating real and fake, in two well separated clusters.
    fn clusters(n: usize) -> Dataset {
        let mut ds = Dataset::default();
        for i in 0..n {
            let fake = (i % 2) as u8;
            let centre = if fake == 1 { 2.0 } else { -2.0 };
            let jitter = (i as f32 * 0.37).sin() * 0.3;
            ds.rows.push(vec![centre + jitter; crate::features::FEATURE_COUNT]);
            ds.targets.push(fake);
            ds.sources.push(format!("row{i}"));
        }
        ds
    }

    #[test]
    fn training_separates_clusters_and_round_trips() -> anyhow::Result<()> {
        let ds = clusters(20);
        let opts = TrainOpts {
            forest: ForestParams {
                n_trees: 10,
                ..ForestParams::default()
            },
            boosting: BoostingParams {
                n_rounds: 10,
                ..BoostingParams::default()
            },
            ..TrainOpts::default()
        };

        let set = train(&ds, &opts)?;
        assert_eq!(set.models.len(), 4);
        assert_eq!(set.metadata.model_priority.len(), 4);
        assert_eq!(set.metadata.best_model, set.metadata.model_priority[0]);
        for s in set.metadata.models.values() {
            assert_eq!(s.accuracy, 1.0);
        }

        let dir = tempfile::tempdir()?;
        set.write(dir.path())?;
        let registry = crate::model::ModelRegistry::initialize(dir.path())?;
        assert_eq!(registry.len(), 4);
        assert!(registry.load_failures().is_empty());
        Ok(())
    }

    #[test]
    fn svm_is_fit_calibrated_and_served_from_disk() -> anyhow::Result<()> {
        let ds = clusters(24);
        let set = train(
            &ds,
            &TrainOpts {
                families: vec![Family::Svm],
                ..TrainOpts::default()
            },
        )?;
        let ModelArtifact::Svm(svm) = &set.models["svm"] else {
            anyhow::bail!("expected an svm artifact, got {}", set.models["svm"].kind());
        };
        // The fitted sigmoid replaced the uncalibrated default.
        assert_ne!((svm.platt_a, svm.platt_b), (-1.0, 0.0));
        assert!(svm.platt_a < 0.0);
        assert_eq!(set.metadata.best_model, "svm");

        let dir = tempfile::tempdir()?;
        set.write(dir.path())?;
        let registry = crate::model::ModelRegistry::initialize(dir.path())?;
        assert_eq!(registry.model_names().collect::<Vec<_>>(), ["svm"]);

        let fake_row = crate::features::FeatureVector::new(ds.rows[1].clone());
        let out = registry.predict(&fake_row)?;
        assert_eq!(out.predictions["svm"].label, crate::model::Label::Fake);
        Ok(())
    }

    #[test]
    fn other_families_are_wrapped_with_their_calibration() -> anyhow::Result<()> {
        let set = train(
            &clusters(20),
            &TrainOpts {
                families: vec![Family::LogisticRegression],
                ..TrainOpts::default()
            },
        )?;
        match &set.models["logistic_regression"] {
            ModelArtifact::Calibrated(c) => {
                assert!(c.calibration.a < 0.0);
                assert_eq!(c.base.kind(), "logistic_regression");
            }
            other => anyhow::bail!("expected a calibrated artifact, got {}", other.kind()),
        }

        let uncalibrated = train(
            &clusters(20),
            &TrainOpts {
                families: vec![Family::LogisticRegression],
                calibration_fraction: 0.0,
                ..TrainOpts::default()
            },
        )?;
        assert_eq!(uncalibrated.models["logistic_regression"].kind(), "logistic_regression");
        Ok(())
    }

    #[test]
    fn one_class_is_rejected() {
        let ds = Dataset {
            rows: vec![vec![0.0; 4]; 4],
            targets: vec![0; 4],
            ..Dataset::default()
        };
        assert!(matches!(train(&ds, &TrainOpts::default()), Err(Error::InvalidInput(_))));
    }
}
