//! The top-level detection API.
//!
//! A [`Detector`] owns the long-lived state of the pipeline:
//! - the model [`Ensemble`] (loaded once, shared read-only by every request)
//! - the result and feature caches
//! - the health monitor
//!
//! Every `predict_*` call returns an [`AnalysisResponse`]. Failures are reported in the
//! response body rather than as `Err`, and every outcome is recorded by the health monitor.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio_pipeline::TARGET_SAMPLE_RATE;
use crate::cache::{CacheKey, TtlCache};
use crate::decision::{DecisionPolicy, decide};
use crate::features::{self, FEATURE_COUNT, FEATURE_LAYOUT_VERSION, FeatureVector};
use crate::health::{HealthMonitor, HealthReport};
use crate::input::{extension_of, validate_upload};
use crate::loader;
use crate::model::{Ensemble, ModelRegistry};
use crate::opts::Opts;
use crate::response::{AnalysisResponse, AnalysisResult, AudioInfo};
use crate::waveform::Waveform;
use crate::{Error, Result};

/// Snapshot of what the detector is serving, for status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectorStatus {
    pub ready: bool,
    /// Why the detector is not ready (absent when it is).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models_dir: Option<String>,
    pub models: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub excluded_models: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub feature_count: usize,
    pub sample_rate: u32,
    pub cached_results: usize,
    pub version: &'static str,
}

pub struct Detector {
    opts: Opts,
    ensemble: RwLock<Ensemble>,
    results: TtlCache<AnalysisResult>,
    features: TtlCache<FeatureVector>,
    health: HealthMonitor,
}

impl Detector {
    /// Create an unready detector. Call [`Detector::initialize`] before predicting.
    ///
    /// Fails with [`Error::InvalidInput`] when `opts` does not pass [`Opts::validate`].
    pub fn new(opts: Opts) -> Result<Self> {
        opts.validate()?;
        let capacity = opts.cache_capacity;
        Ok(Self {
            opts,
            ensemble: RwLock::new(Ensemble::default()),
            results: TtlCache::new(capacity),
            features: TtlCache::new(capacity),
            health: HealthMonitor::new(),
        })
    }

    pub fn opts(&self) -> &Opts {
        &self.opts
    }

    /// Load the model artifacts in `models_dir`, replacing any previously loaded set.
    ///
    /// Both caches are cleared whether or not loading succeeds. On failure the detector is
    /// unready and predictions report the failure as `not_initialized`.
    pub fn initialize(&self, models_dir: impl AsRef<Path>) -> Result<()> {
        let mut ensemble = self
            .ensemble
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let res = ensemble.initialize(models_dir);
        self.results.invalidate_all();
        self.features.invalidate_all();
        res
    }

    /// Serve an already-built model set, dropping every cached entry.
    pub fn install(&self, registry: ModelRegistry) {
        self.ensemble
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .install(registry);
        self.results.invalidate_all();
        self.features.invalidate_all();
    }

    /// Unload the models and drop every cached entry.
    pub fn shutdown(&self) {
        self.ensemble
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown();
        self.results.invalidate_all();
        self.features.invalidate_all();
        info!("detector shut down");
    }

    pub fn is_ready(&self) -> bool {
        self.ensemble
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_ready()
    }

    fn registry(&self) -> Result<Arc<ModelRegistry>> {
        self.ensemble
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .registry()
    }

    /// Analyse an audio file on disk.
    pub fn predict_file(&self, path: impl AsRef<Path>) -> AnalysisResponse {
        let path = path.as_ref();
        self.respond(|| {
            let source = path.display().to_string();
            let bytes = read_source(path)?;
            self.analyze_encoded(bytes, extension_of(&source), source)
        })
    }

    /// Analyse a spooled upload: `path` holds the bytes, `file_name` is the client's name for
    /// them (checked against the size and extension limits, and reported as the source).
    pub fn predict_upload(&self, file_name: &str, path: impl AsRef<Path>) -> AnalysisResponse {
        let path = path.as_ref();
        self.respond(|| {
            let size = fs::metadata(path)
                .map_err(|e| Error::load(format!("cannot stat '{}': {e}", path.display())))?
                .len();
            validate_upload(file_name, size, &self.opts)?;
            let bytes = read_source(path)?;
            self.analyze_encoded(bytes, extension_of(file_name), file_name.to_owned())
        })
    }

    /// Analyse an encoded stream. `hint` is a container extension such as `"mp3"`.
    pub fn predict_reader<R: Read>(&self, mut reader: R, hint: Option<&str>) -> AnalysisResponse {
        self.respond(|| {
            let mut bytes = Vec::new();
            reader
                .read_to_end(&mut bytes)
                .map_err(|e| Error::load(format!("cannot read audio stream: {e}")))?;
            self.analyze_encoded(bytes, hint.map(str::to_ascii_lowercase), "stream".to_owned())
        })
    }

    /// Analyse an encoded payload held in memory.
    pub fn predict_bytes(&self, bytes: Vec<u8>, hint: Option<&str>) -> AnalysisResponse {
        self.respond(|| {
            self.analyze_encoded(bytes, hint.map(str::to_ascii_lowercase), "bytes".to_owned())
        })
    }

    /// Analyse raw mono samples recorded at `sample_rate`.
    pub fn predict_audio(&self, samples: Vec<f32>, sample_rate: u32) -> AnalysisResponse {
        self.respond(|| {
            let registry = self.registry()?;
            let waveform = loader::load_samples(samples, sample_rate, &self.opts)?;
            let key = CacheKey::new(registry.fingerprint(), waveform.content_hash());
            if let Some(hit) = self.results.get(&key) {
                debug!("result cache hit");
                return Ok((hit, true));
            }
            let result = self.analyze_waveform(&registry, &waveform, "samples".to_owned())?;
            self.results
                .put(key, result.clone(), self.opts.cache_ttl());
            Ok((result, false))
        })
    }

    /// Success rate, latency and per-model status.
    pub fn health(&self) -> HealthReport {
        let mut model_status = BTreeMap::new();
        if let Ok(registry) = self.registry() {
            for name in registry.model_names() {
                model_status.insert(name.to_owned(), true);
            }
            for name in registry.load_failures().keys() {
                model_status.insert(name.clone(), false);
            }
        }
        self.health.report(model_status)
    }

    pub fn status(&self) -> DetectorStatus {
        let ensemble = self
            .ensemble
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut status = DetectorStatus {
            ready: false,
            reason: None,
            models_dir: None,
            models: Vec::new(),
            excluded_models: BTreeMap::new(),
            best_model: None,
            fingerprint: None,
            feature_count: FEATURE_COUNT,
            sample_rate: TARGET_SAMPLE_RATE,
            cached_results: self.results.len(),
            version: env!("CARGO_PKG_VERSION"),
        };
        match ensemble {
            Ensemble::Ready(registry) => {
                status.ready = true;
                status.models_dir = registry.dir().map(|dir| dir.display().to_string());
                status.models = registry.model_names().map(str::to_owned).collect();
                status.excluded_models = registry.load_failures().clone();
                status.best_model = Some(registry.metadata().best_model.clone());
                status.fingerprint = Some(registry.fingerprint().to_owned());
            }
            Ensemble::Unready(reason) => status.reason = Some(reason),
        }
        status
    }

    fn respond<F>(&self, analyze: F) -> AnalysisResponse
    where
        F: FnOnce() -> Result<(AnalysisResult, bool)>,
    {
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(analyze))
            .unwrap_or_else(|_| Err(Error::from(anyhow::anyhow!("analysis panicked"))));
        let elapsed = started.elapsed();

        match outcome {
            Ok((result, cached)) => {
                self.health.record_outcome(true, elapsed);
                let analysis_id = Uuid::new_v4();
                info!(
                    %analysis_id,
                    source = %result.audio.source,
                    result = result.decision.label.as_str(),
                    confidence = result.decision.confidence,
                    model = %result.decision.primary_model,
                    cached,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "analysis complete"
                );
                AnalysisResponse::success(&result, elapsed, cached, analysis_id)
            }
            Err(e) => {
                self.health.record_outcome(false, elapsed);
                warn!(error = %e, kind = ?e.kind(), "analysis failed");
                AnalysisResponse::failure(&e, elapsed)
            }
        }
    }

    fn analyze_encoded(
        &self,
        bytes: Vec<u8>,
        hint: Option<String>,
        source: String,
    ) -> Result<(AnalysisResult, bool)> {
        let registry = self.registry()?;
        let key = CacheKey::new(registry.fingerprint(), blake3::hash(&bytes));
        if let Some(mut hit) = self.results.get(&key) {
            debug!(%source, "result cache hit");
            hit.audio.source = source;
            return Ok((hit, true));
        }

        let waveform = loader::load_bytes(bytes, hint.as_deref(), &self.opts)?;
        let result = self.analyze_waveform(&registry, &waveform, source)?;
        self.results
            .put(key, result.clone(), self.opts.cache_ttl());
        Ok((result, false))
    }

    fn analyze_waveform(
        &self,
        registry: &ModelRegistry,
        waveform: &Waveform,
        source: String,
    ) -> Result<AnalysisResult> {
        let features = self.features_for(waveform)?;
        let predictions = registry.predict(&features)?;
        let policy = DecisionPolicy::new(registry.metadata(), &self.opts);
        let decision = decide(&predictions, &policy)?;

        Ok(AnalysisResult {
            decision,
            predictions: predictions.predictions,
            failed_models: predictions.failures,
            models_available: registry.model_names().map(str::to_owned).collect(),
            audio: AudioInfo {
                duration: waveform.duration_seconds(),
                sample_rate: waveform.sample_rate(),
                source,
            },
            feature_count: features.len(),
        })
    }

    /// Feature vectors do not depend on the models, so they are keyed by layout version.
    fn features_for(&self, waveform: &Waveform) -> Result<FeatureVector> {
        let key = CacheKey::new(
            format!("features-v{FEATURE_LAYOUT_VERSION}"),
            waveform.content_hash(),
        );
        if let Some(hit) = self.features.get(&key) {
            debug!("feature cache hit");
            return Ok(hit);
        }
        let features = features::extract(waveform)?;
        self.features
            .put(key, features.clone(), self.opts.cache_ttl());
        Ok(features)
    }
}

fn read_source(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::load(format!("cannot read '{}': {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::{
        LogisticRegression, ModelArtifact, ModelMetadata, ModelStats, StandardScaler,
        registry::write_artifacts,
    };

    fn write_single_model(dir: &Path, bias: f32) -> anyhow::Result<()> {
        let metadata = ModelMetadata {
            best_model: "logistic_regression".into(),
            models: BTreeMap::from([(
                "logistic_regression".to_owned(),
                ModelStats {
                    accuracy: 1.0,
                    auc_score: 1.0,
                    training_time: 0.0,
                },
            )]),
            training_date: "2026-01-01T00:00:00Z".into(),
            num_features: FEATURE_COUNT,
            sample_rate: TARGET_SAMPLE_RATE,
            feature_layout_version: Some(FEATURE_LAYOUT_VERSION),
            model_priority: Vec::new(),
        };
        let scaler = StandardScaler {
            mean: vec![0.0; FEATURE_COUNT],
            scale: vec![1.0; FEATURE_COUNT],
        };
        let model =
            ModelArtifact::LogisticRegression(LogisticRegression::new(vec![0.0; FEATURE_COUNT], bias));
        write_artifacts(dir, &metadata, &scaler, [("logistic_regression", &model)])?;
        Ok(())
    }

    fn tone(seconds: f32) -> Vec<f32> {
        let n = (seconds * TARGET_SAMPLE_RATE as f32) as usize;
        (0..n)
            .map(|i| {
                let t = i as f32 / TARGET_SAMPLE_RATE as f32;
                0.6 * (2.0 * std::f32::consts::PI * 180.0 * t).sin()
            })
            .collect()
    }

    #[test]
    fn unready_detector_reports_not_initialized() -> anyhow::Result<()> {
        let detector = Detector::new(Opts::default())?;
        let resp = detector.predict_audio(tone(1.0), TARGET_SAMPLE_RATE);
        let failure = resp.as_failure().map(|f| f.kind);
        assert_eq!(failure, Some(ErrorKind::NotInitialized));
        assert_eq!(detector.health().failed_analyses, 1);
        Ok(())
    }

    #[test]
    fn invalid_options_are_refused() {
        let opts = Opts {
            cache_ttl_seconds: u64::MAX,
            ..Opts::default()
        };
        assert!(matches!(Detector::new(opts), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn second_identical_request_is_served_from_cache() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_single_model(dir.path(), 1.0)?;
        let detector = Detector::new(Opts::default())?;
        detector.initialize(dir.path())?;

        let first = detector.predict_audio(tone(1.0), TARGET_SAMPLE_RATE);
        let second = detector.predict_audio(tone(1.0), TARGET_SAMPLE_RATE);
        let (first, second) = (
            first.as_success().ok_or_else(|| anyhow::anyhow!("first failed"))?,
            second.as_success().ok_or_else(|| anyhow::anyhow!("second failed"))?,
        );
        assert!(!first.processing_info.cached);
        assert!(second.processing_info.cached);
        assert_eq!(first.classification, second.classification);
        assert_eq!(first.processing_info.best_model_used, "logistic_regression");
        Ok(())
    }

    #[test]
    fn reinitializing_clears_cached_results() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_single_model(dir.path(), 1.0)?;
        let detector = Detector::new(Opts::default())?;
        detector.initialize(dir.path())?;
        let _ = detector.predict_audio(tone(1.0), TARGET_SAMPLE_RATE);
        assert_eq!(detector.status().cached_results, 1);

        write_single_model(dir.path(), -1.0)?;
        detector.initialize(dir.path())?;
        assert_eq!(detector.status().cached_results, 0);

        let resp = detector.predict_audio(tone(1.0), TARGET_SAMPLE_RATE);
        let success = resp.as_success().ok_or_else(|| anyhow::anyhow!("analysis failed"))?;
        assert!(!success.processing_info.cached);
        assert_eq!(success.classification.result, crate::model::Label::Real);
        Ok(())
    }

    #[test]
    fn shutdown_makes_the_detector_unready() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_single_model(dir.path(), 1.0)?;
        let detector = Detector::new(Opts::default())?;
        detector.initialize(dir.path())?;
        assert!(detector.status().ready);

        detector.shutdown();
        let status = detector.status();
        assert!(!status.ready);
        assert!(status.reason.is_some());
        assert!(!detector.predict_audio(tone(1.0), TARGET_SAMPLE_RATE).is_success());
        Ok(())
    }

    #[test]
    fn uploads_are_validated_before_decoding() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_single_model(dir.path(), 1.0)?;
        let detector = Detector::new(Opts::default())?;
        detector.initialize(dir.path())?;

        let upload = dir.path().join("upload.bin");
        fs::write(&upload, b"anything")?;
        let resp = detector.predict_upload("notes.txt", &upload);
        assert_eq!(resp.as_failure().map(|f| f.kind), Some(ErrorKind::InvalidInput));
        Ok(())
    }
}
