//! Loading a model artifact directory and scoring feature vectors against every member.
//!
//! Directory layout:
//! - `model_metadata.json` ([`ModelMetadata`]), required
//! - `scaler.json` ([`StandardScaler`]), required
//! - `<name>_model.json` ([`ModelArtifact`]) for each name listed in the metadata
//!
//! A member that is missing or fails validation is excluded (and logged); the registry only
//! fails to initialize when a required file is bad or no member loads at all.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Classifier, ModelArtifact, ModelMetadata, ModelPrediction, StandardScaler};
use crate::audio_pipeline::TARGET_SAMPLE_RATE;
use crate::features::{FEATURE_COUNT, FEATURE_LAYOUT_VERSION, FeatureVector};
use crate::{Error, Result};

pub const METADATA_FILE: &str = "model_metadata.json";
pub const SCALER_FILE: &str = "scaler.json";

/// File name of the artifact for the ensemble member `name`.
pub fn model_file_name(name: &str) -> String {
    format!("{name}_model.json")
}

/// Per-model outputs for one feature vector, keyed (and therefore ordered) by model name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnsemblePredictions {
    pub predictions: BTreeMap<String, ModelPrediction>,
    /// Models that could not score this vector, with the reason.
    pub failures: BTreeMap<String, String>,
}

/// An immutable, validated set of models sharing one scaler.
pub struct ModelRegistry {
    dir: Option<PathBuf>,
    metadata: ModelMetadata,
    scaler: StandardScaler,
    models: BTreeMap<String, Arc<dyn Classifier>>,
    load_failures: BTreeMap<String, String>,
    fingerprint: String,
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("dir", &self.dir)
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .field("load_failures", &self.load_failures)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::init(format!("cannot read '{}': {e}", path.display())))
}

fn parse<T: DeserializeOwned>(path: &Path, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::init(format!("cannot parse '{}': {e}", path.display())))
}

impl ModelRegistry {
    /// Load and validate every artifact in `dir`.
    pub fn initialize(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(Error::init(format!(
                "model directory '{}' does not exist",
                dir.display()
            )));
        }

        let metadata_path = dir.join(METADATA_FILE);
        let metadata_bytes = read_file(&metadata_path)?;
        let metadata: ModelMetadata = parse(&metadata_path, &metadata_bytes)?;

        let scaler_path = dir.join(SCALER_FILE);
        let scaler_bytes = read_file(&scaler_path)?;
        let scaler: StandardScaler = parse(&scaler_path, &scaler_bytes)?;
        scaler.validate()?;

        check_contract(&metadata, &scaler)?;

        let mut hasher = blake3::Hasher::new();
        hasher.update(&metadata_bytes);
        hasher.update(&scaler_bytes);

        let mut models = BTreeMap::new();
        let mut load_failures = BTreeMap::new();
        for name in metadata.models.keys() {
            let path = dir.join(model_file_name(name));
            match load_member(&path, scaler.width()) {
                Ok((model, bytes)) => {
                    debug!(model = %name, kind = model.kind(), "loaded model");
                    hasher.update(name.as_bytes());
                    hasher.update(&bytes);
                    models.insert(name.clone(), Arc::new(model) as Arc<dyn Classifier>);
                }
                Err(e) => {
                    warn!(model = %name, error = %e, "excluding model from ensemble");
                    load_failures.insert(name.clone(), e.to_string());
                }
            }
        }

        if models.is_empty() {
            let reasons: Vec<String> = load_failures
                .iter()
                .map(|(name, reason)| format!("{name}: {reason}"))
                .collect();
            return Err(Error::init(if reasons.is_empty() {
                "metadata lists no models".to_owned()
            } else {
                format!("no model could be loaded ({})", reasons.join("; "))
            }));
        }

        if !models.contains_key(&metadata.best_model) {
            warn!(best_model = %metadata.best_model, "best model is not loaded; decisions will fall back");
        }

        let fingerprint = hasher.finalize().to_hex().to_string();
        info!(
            dir = %dir.display(),
            models = models.len(),
            excluded = load_failures.len(),
            fingerprint = %fingerprint,
            "model registry initialized"
        );

        Ok(Self {
            dir: Some(dir.to_path_buf()),
            metadata,
            scaler,
            models,
            load_failures,
            fingerprint,
        })
    }

    /// Build a registry from in-memory members instead of an artifact directory.
    ///
    /// The same contract checks as [`ModelRegistry::initialize`] apply, except that a member
    /// with the wrong input width is an error rather than being excluded. The fingerprint
    /// is unique per call, so results cached against another registry are never reused.
    pub fn from_classifiers(
        metadata: ModelMetadata,
        scaler: StandardScaler,
        models: impl IntoIterator<Item = (String, Arc<dyn Classifier>)>,
    ) -> Result<Self> {
        scaler.validate()?;
        check_contract(&metadata, &scaler)?;

        let mut hasher = blake3::Hasher::new();
        hasher.update(&serde_json::to_vec(&metadata)?);
        hasher.update(&serde_json::to_vec(&scaler)?);
        hasher.update(Uuid::new_v4().as_bytes());

        let mut loaded = BTreeMap::new();
        for (name, model) in models {
            if !metadata.models.contains_key(&name) {
                return Err(Error::init(format!("model '{name}' is not listed in the metadata")));
            }
            if model.input_width() != scaler.width() {
                return Err(Error::init(format!(
                    "model '{name}' expects {} features, scaler has {}",
                    model.input_width(),
                    scaler.width()
                )));
            }
            hasher.update(name.as_bytes());
            loaded.insert(name, model);
        }
        if loaded.is_empty() {
            return Err(Error::init("no models were provided"));
        }
        let fingerprint = hasher.finalize().to_hex().to_string();
        info!(models = loaded.len(), fingerprint = %fingerprint, "model registry installed");

        Ok(Self {
            dir: None,
            metadata,
            scaler,
            models: loaded,
            load_failures: BTreeMap::new(),
            fingerprint,
        })
    }

    /// Artifact directory the registry was loaded from (`None` for in-memory registries).
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn scaler(&self) -> &StandardScaler {
        &self.scaler
    }

    /// Names of the loaded members, sorted.
    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Members listed in the metadata that were excluded at load time.
    pub fn load_failures(&self) -> &BTreeMap<String, String> {
        &self.load_failures
    }

    /// blake3 digest (hex) of the metadata, the scaler and every loaded artifact.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Scale `features` once, then score it with every member independently.
    ///
    /// A width mismatch against the scaler fails the whole call; a member that errors, panics
    /// or produces non-finite probabilities is reported in [`EnsemblePredictions::failures`].
    pub fn predict(&self, features: &FeatureVector) -> Result<EnsemblePredictions> {
        let scaled = self.scaler.transform(features.as_slice())?;

        let mut out = EnsemblePredictions::default();
        for (name, model) in &self.models {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| model.predict_proba(&scaled)));
            let Ok(outcome) = outcome else {
                warn!(model = %name, "model panicked during prediction");
                out.failures
                    .insert(name.clone(), "model panicked during prediction".to_owned());
                continue;
            };
            match outcome {
                Ok(p) if p.is_finite() => {
                    out.predictions
                        .insert(name.clone(), ModelPrediction::from_probabilities(p));
                }
                Ok(_) => {
                    warn!(model = %name, "model produced non-finite probabilities");
                    out.failures
                        .insert(name.clone(), "non-finite probabilities".to_owned());
                }
                Err(e) => {
                    warn!(model = %name, error = %e, "model prediction failed");
                    out.failures.insert(name.clone(), e.to_string());
                }
            }
        }
        Ok(out)
    }
}

fn check_contract(metadata: &ModelMetadata, scaler: &StandardScaler) -> Result<()> {
    if scaler.width() != FEATURE_COUNT {
        return Err(Error::init(format!(
            "scaler expects {} features but the extractor produces {FEATURE_COUNT}",
            scaler.width()
        )));
    }
    if metadata.num_features != scaler.width() {
        return Err(Error::init(format!(
            "metadata declares {} features but the scaler has {}",
            metadata.num_features,
            scaler.width()
        )));
    }
    if metadata.sample_rate != TARGET_SAMPLE_RATE {
        return Err(Error::init(format!(
            "models were trained at {} Hz, analysis runs at {TARGET_SAMPLE_RATE} Hz",
            metadata.sample_rate
        )));
    }
    if let Some(version) = metadata
        .feature_layout_version
        .filter(|v| *v != FEATURE_LAYOUT_VERSION)
    {
        return Err(Error::init(format!(
            "models use feature layout v{version}, extractor is v{FEATURE_LAYOUT_VERSION}"
        )));
    }
    Ok(())
}

fn load_member(path: &Path, width: usize) -> Result<(ModelArtifact, Vec<u8>)> {
    let bytes = read_file(path)?;
    let model: ModelArtifact = parse(path, &bytes)?;
    model.validate()?;
    if model.input_width() != width {
        return Err(Error::init(format!(
            "model expects {} features, scaler has {width}",
            model.input_width()
        )));
    }
    Ok((model, bytes))
}

/// Write a complete artifact directory (used by the trainer and by tests).
pub fn write_artifacts<'a>(
    dir: impl AsRef<Path>,
    metadata: &ModelMetadata,
    scaler: &StandardScaler,
    models: impl IntoIterator<Item = (&'a str, &'a ModelArtifact)>,
) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    fs::write(dir.join(METADATA_FILE), serde_json::to_vec_pretty(metadata)?)?;
    fs::write(dir.join(SCALER_FILE), serde_json::to_vec(scaler)?)?;
    for (name, model) in models {
        fs::write(dir.join(model_file_name(name)), serde_json::to_vec(model)?)?;
    }
    Ok(())
}

/// Lifecycle wrapper around a [`ModelRegistry`].
///
/// `Unready` carries the reason (the init failure, or a shutdown note) so that predictions
/// made before a successful [`Ensemble::initialize`] can report why they were refused.
#[derive(Debug, Clone)]
pub enum Ensemble {
    Unready(String),
    Ready(Arc<ModelRegistry>),
}

impl Default for Ensemble {
    fn default() -> Self {
        Self::Unready("models have not been loaded".to_owned())
    }
}

impl Ensemble {
    /// Load `dir`, replacing whatever was loaded before. On failure the ensemble is unready.
    pub fn initialize(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        match ModelRegistry::initialize(dir) {
            Ok(registry) => {
                *self = Self::Ready(Arc::new(registry));
                Ok(())
            }
            Err(e) => {
                *self = Self::Unready(e.to_string());
                Err(e)
            }
        }
    }

    /// Serve an already-built registry.
    pub fn install(&mut self, registry: ModelRegistry) {
        *self = Self::Ready(Arc::new(registry));
    }

    pub fn shutdown(&mut self) {
        *self = Self::Unready("models were unloaded".to_owned());
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn registry(&self) -> Result<Arc<ModelRegistry>> {
        match self {
            Self::Ready(r) => Ok(Arc::clone(r)),
            Self::Unready(reason) => Err(Error::NotInitialized(reason.clone())),
        }
    }

    pub fn predict(&self, features: &FeatureVector) -> Result<EnsemblePredictions> {
        self.registry()?.predict(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LogisticRegression, ModelStats};

    fn metadata(names: &[&str]) -> ModelMetadata {
        ModelMetadata {
            best_model: names[0].to_owned(),
            models: names
                .iter()
                .map(|n| {
                    (
                        (*n).to_owned(),
                        ModelStats {
                            accuracy: 0.9,
                            auc_score: 0.9,
                            training_time: 0.1,
                        },
                    )
                })
                .collect(),
            training_date: "2025-01-01T00:00:00Z".to_owned(),
            num_features: FEATURE_COUNT,
            sample_rate: TARGET_SAMPLE_RATE,
            feature_layout_version: Some(FEATURE_LAYOUT_VERSION),
            model_priority: Vec::new(),
        }
    }

    fn scaler() -> StandardScaler {
        StandardScaler {
            mean: vec![0.0; FEATURE_COUNT],
            scale: vec![1.0; FEATURE_COUNT],
        }
    }

    fn linear(bias: f32) -> ModelArtifact {
        ModelArtifact::LogisticRegression(LogisticRegression::new(vec![0.0; FEATURE_COUNT], bias))
    }

    struct Fixed(f32);

    impl Classifier for Fixed {
        fn input_width(&self) -> usize {
            FEATURE_COUNT
        }

        fn predict_proba(&self, _x: &[f32]) -> Result<crate::model::Probabilities> {
            Ok(crate::model::Probabilities::from_fake(self.0))
        }
    }

    #[test]
    fn in_memory_registries_check_the_same_contract() {
        let unlisted = ModelRegistry::from_classifiers(
            metadata(&["a"]),
            scaler(),
            [("b".to_owned(), Arc::new(Fixed(0.9)) as Arc<dyn Classifier>)],
        );
        assert!(matches!(unlisted, Err(Error::Init(_))));

        let empty = ModelRegistry::from_classifiers(
            metadata(&["a"]),
            scaler(),
            Vec::<(String, Arc<dyn Classifier>)>::new(),
        );
        assert!(matches!(empty, Err(Error::Init(_))));
    }

    #[test]
    fn in_memory_registries_get_distinct_fingerprints() -> anyhow::Result<()> {
        let build = || {
            ModelRegistry::from_classifiers(
                metadata(&["a"]),
                scaler(),
                [("a".to_owned(), Arc::new(Fixed(0.9)) as Arc<dyn Classifier>)],
            )
        };
        let (x, y) = (build()?, build()?);
        assert!(x.dir().is_none());
        assert_ne!(x.fingerprint(), y.fingerprint());

        let preds = x.predict(&FeatureVector::new(vec![0.0; FEATURE_COUNT]))?;
        assert_eq!(preds.predictions["a"].label, crate::model::Label::Fake);
        Ok(())
    }

    struct Panicking;

    impl Classifier for Panicking {
        fn input_width(&self) -> usize {
            FEATURE_COUNT
        }

        fn predict_proba(&self, _x: &[f32]) -> Result<crate::model::Probabilities> {
            panic!("tree index out of bounds")
        }
    }

    #[test]
    fn a_panicking_member_is_recorded_as_a_failure() -> anyhow::Result<()> {
        let registry = ModelRegistry::from_classifiers(
            metadata(&["a", "b"]),
            scaler(),
            [
                ("a".to_owned(), Arc::new(Panicking) as Arc<dyn Classifier>),
                ("b".to_owned(), Arc::new(Fixed(0.8)) as Arc<dyn Classifier>),
            ],
        )?;
        let out = registry.predict(&FeatureVector::new(vec![0.0; FEATURE_COUNT]))?;
        assert!(out.failures["a"].contains("panicked"));
        assert_eq!(out.predictions.len(), 1);
        assert!(out.predictions.contains_key("b"));
        Ok(())
    }

    #[test]
    fn missing_directory_fails_init() {
        let err = ModelRegistry::initialize("/definitely/not/here").unwrap_err();
        assert!(matches!(err, Error::Init(_)));
    }

    #[test]
    fn broken_member_is_excluded() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let good = linear(2.0);
        write_artifacts(dir.path(), &metadata(&["a", "b"]), &scaler(), [("a", &good)])?;
        fs::write(dir.path().join(model_file_name("b")), b"{not json")?;

        let registry = ModelRegistry::initialize(dir.path())?;
        assert_eq!(registry.model_names().collect::<Vec<_>>(), vec!["a"]);
        assert!(registry.load_failures().contains_key("b"));

        let out = registry.predict(&FeatureVector::new(vec![0.0; FEATURE_COUNT]))?;
        assert_eq!(out.predictions.len(), 1);
        Ok(())
    }

    #[test]
    fn wrong_width_member_is_excluded() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let narrow = ModelArtifact::LogisticRegression(LogisticRegression::new(vec![1.0; 3], 0.0));
        let good = linear(0.0);
        write_artifacts(
            dir.path(),
            &metadata(&["good", "narrow"]),
            &scaler(),
            [("good", &good), ("narrow", &narrow)],
        )?;
        let registry = ModelRegistry::initialize(dir.path())?;
        assert_eq!(registry.len(), 1);
        assert!(registry.load_failures()["narrow"].contains("expects 3 features"));
        Ok(())
    }

    #[test]
    fn fingerprint_changes_with_artifacts() -> anyhow::Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        write_artifacts(a.path(), &metadata(&["m"]), &scaler(), [("m", &linear(0.5))])?;
        write_artifacts(b.path(), &metadata(&["m"]), &scaler(), [("m", &linear(-0.5))])?;
        let fa = ModelRegistry::initialize(a.path())?.fingerprint().to_owned();
        let fb = ModelRegistry::initialize(b.path())?.fingerprint().to_owned();
        assert_ne!(fa, fb);
        Ok(())
    }

    #[test]
    fn sample_rate_mismatch_fails_init() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut meta = metadata(&["m"]);
        meta.sample_rate = 16_000;
        write_artifacts(dir.path(), &meta, &scaler(), [("m", &linear(0.0))])?;
        assert!(matches!(
            ModelRegistry::initialize(dir.path()),
            Err(Error::Init(_))
        ));
        Ok(())
    }

    #[test]
    fn unready_ensemble_reports_the_init_failure() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut ensemble = Ensemble::default();
        assert!(ensemble.initialize(dir.path()).is_err());
        assert!(!ensemble.is_ready());

        let err = ensemble
            .predict(&FeatureVector::new(vec![0.0; FEATURE_COUNT]))
            .unwrap_err();
        match err {
            Error::NotInitialized(reason) => assert!(reason.contains(METADATA_FILE)),
            other => panic!("unexpected error: {other}"),
        }
        Ok(())
    }

    #[test]
    fn dimension_mismatch_fails_the_whole_prediction() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_artifacts(dir.path(), &metadata(&["m"]), &scaler(), [("m", &linear(0.0))])?;
        let registry = ModelRegistry::initialize(dir.path())?;
        let err = registry.predict(&FeatureVector::new(vec![0.0; 10])).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
        Ok(())
    }
}
