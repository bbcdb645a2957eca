//! Typed analysis results and their JSON wire form.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::decision::Decision;
use crate::error::{Error, ErrorKind};
use crate::model::{Label, ModelPrediction};

/// Everything an analysis produced, independent of how it is reported. This is what the
/// result cache stores.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub decision: Decision,
    pub predictions: BTreeMap<String, ModelPrediction>,
    /// Models that were loaded but could not score this input.
    pub failed_models: BTreeMap<String, String>,
    pub models_available: Vec<String>,
    pub audio: AudioInfo,
    pub feature_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioInfo {
    /// Seconds of audio that were analysed (after trimming and truncation).
    pub duration: f64,
    pub sample_rate: u32,
    /// File name, path, or `"samples"` for raw-array requests.
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub result: Label,
    pub confidence: f32,
    pub fake_probability: f32,
    pub real_probability: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnsembleResult {
    pub result: Label,
    pub confidence: f32,
    pub verdict: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbabilityBody {
    pub real: f32,
    pub fake: f32,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelPredictionBody {
    pub prediction: Label,
    pub confidence: f32,
    pub probabilities: ProbabilityBody,
}

impl From<&ModelPrediction> for ModelPredictionBody {
    fn from(p: &ModelPrediction) -> Self {
        Self {
            prediction: p.label,
            confidence: p.confidence(),
            probabilities: ProbabilityBody {
                real: p.probabilities.real,
                fake: p.probabilities.fake,
                confidence: p.confidence(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingInfo {
    /// Wall-clock seconds spent on this request.
    pub processing_time: f64,
    pub best_model_used: String,
    pub models_available: Vec<String>,
    pub feature_count: usize,
    pub cached: bool,
    pub analysis_id: Uuid,
    pub version: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisSuccess {
    pub success: bool,
    pub classification: Classification,
    pub ensemble_result: EnsembleResult,
    pub model_predictions: BTreeMap<String, ModelPredictionBody>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub failed_models: BTreeMap<String, String>,
    pub audio_info: AudioInfo,
    pub processing_info: ProcessingInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedClassification {
    pub result: &'static str,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureTiming {
    pub processing_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisFailure {
    pub success: bool,
    pub error: String,
    pub kind: ErrorKind,
    pub classification: FailedClassification,
    pub processing_info: FailureTiming,
}

/// The outcome of one predict call, serialized as the analysis response body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AnalysisResponse {
    Success(Box<AnalysisSuccess>),
    Failure(AnalysisFailure),
}

impl AnalysisResponse {
    pub fn success(
        result: &AnalysisResult,
        processing_time: Duration,
        cached: bool,
        analysis_id: Uuid,
    ) -> Self {
        let d = &result.decision;
        Self::Success(Box::new(AnalysisSuccess {
            success: true,
            classification: Classification {
                result: d.label,
                confidence: d.confidence,
                fake_probability: d.probabilities.fake * 100.0,
                real_probability: d.probabilities.real * 100.0,
            },
            ensemble_result: EnsembleResult {
                result: d.ensemble.label,
                confidence: d.ensemble.confidence,
                verdict: d.ensemble.label.verdict(),
            },
            model_predictions: result
                .predictions
                .iter()
                .map(|(name, p)| (name.clone(), ModelPredictionBody::from(p)))
                .collect(),
            failed_models: result.failed_models.clone(),
            audio_info: result.audio.clone(),
            processing_info: ProcessingInfo {
                processing_time: processing_time.as_secs_f64(),
                best_model_used: d.primary_model.clone(),
                models_available: result.models_available.clone(),
                feature_count: result.feature_count,
                cached,
                analysis_id,
                version: env!("CARGO_PKG_VERSION"),
            },
        }))
    }

    pub fn failure(err: &Error, processing_time: Duration) -> Self {
        Self::Failure(AnalysisFailure {
            success: false,
            error: err.to_string(),
            kind: err.kind(),
            classification: FailedClassification {
                result: "error",
                confidence: 0.0,
            },
            processing_info: FailureTiming {
                processing_time: processing_time.as_secs_f64(),
            },
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn as_success(&self) -> Option<&AnalysisSuccess> {
        match self {
            Self::Success(s) => Some(s),
            Self::Failure(_) => None,
        }
    }

    pub fn as_failure(&self) -> Option<&AnalysisFailure> {
        match self {
            Self::Success(_) => None,
            Self::Failure(f) => Some(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::EnsembleVerdict;
    use crate::model::Probabilities;

    fn result() -> AnalysisResult {
        let p = ModelPrediction::from_probabilities(Probabilities::from_fake(0.75));
        AnalysisResult {
            decision: Decision {
                primary_model: "random_forest".into(),
                label: p.label,
                confidence: p.confidence(),
                probabilities: p.probabilities,
                ensemble: EnsembleVerdict {
                    label: Label::Fake,
                    confidence: 75.0,
                    fake_votes: 1,
                    real_votes: 0,
                },
            },
            predictions: BTreeMap::from([("random_forest".to_owned(), p)]),
            failed_models: BTreeMap::new(),
            models_available: vec!["random_forest".into()],
            audio: AudioInfo {
                duration: 3.0,
                sample_rate: 22_050,
                source: "voice.wav".into(),
            },
            feature_count: 154,
        }
    }

    #[test]
    fn success_body_has_the_documented_shape() -> anyhow::Result<()> {
        let resp = AnalysisResponse::success(&result(), Duration::from_millis(250), false, Uuid::nil());
        let v = serde_json::to_value(&resp)?;
        assert_eq!(v["success"], true);
        assert_eq!(v["classification"]["result"], "fake");
        assert_eq!(v["classification"]["fake_probability"], 75.0);
        assert_eq!(v["ensemble_result"]["verdict"], "CLONED");
        assert_eq!(v["model_predictions"]["random_forest"]["prediction"], "fake");
        assert_eq!(v["processing_info"]["feature_count"], 154);
        assert_eq!(v["processing_info"]["processing_time"], 0.25);
        assert_eq!(
            v["processing_info"]["analysis_id"],
            "00000000-0000-0000-0000-000000000000"
        );
        assert!(v.get("failed_models").is_none());
        Ok(())
    }

    #[test]
    fn failure_body_carries_kind() -> anyhow::Result<()> {
        let err = Error::NotInitialized("no models".into());
        let v = serde_json::to_value(AnalysisResponse::failure(&err, Duration::ZERO))?;
        assert_eq!(v["success"], false);
        assert_eq!(v["kind"], "not_initialized");
        assert_eq!(v["classification"]["result"], "error");
        Ok(())
    }
}
