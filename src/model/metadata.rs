use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Hold-out metrics recorded for one trained model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    pub accuracy: f64,
    pub auc_score: f64,
    /// Seconds spent fitting.
    pub training_time: f64,
}

/// Contents of `model_metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub best_model: String,
    pub models: BTreeMap<String, ModelStats>,
    pub training_date: String,
    pub num_features: usize,
    pub sample_rate: u32,

    /// Feature layout the models were trained on; absent in older artifact sets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_layout_version: Option<u32>,

    /// Fallback order when `best_model` has no prediction.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub model_priority: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_metadata_without_optional_keys() -> anyhow::Result<()> {
        let json = r#"{
            "best_model": "random_forest",
            "models": {
                "random_forest": {"accuracy": 0.91, "auc_score": 0.95, "training_time": 1.5}
            },
            "training_date": "2025-01-01T00:00:00Z",
            "num_features": 154,
            "sample_rate": 22050
        }"#;
        let meta: ModelMetadata = serde_json::from_str(json)?;
        assert_eq!(meta.best_model, "random_forest");
        assert_eq!(meta.models["random_forest"].auc_score, 0.95);
        assert_eq!(meta.feature_layout_version, None);
        assert!(meta.model_priority.is_empty());
        Ok(())
    }
}
