use std::error::Error as StdError;

use serde::Serialize;
use thiserror::Error;

/// Clonewatch's crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Clonewatch's crate-wide error type.
///
/// This is intentionally decoupled from `anyhow` so downstream libraries aren't forced to
/// adopt `anyhow` in their own public APIs. Internal decode helpers still use `anyhow` for
/// context chains; those are flattened into a message at the loader boundary.
#[derive(Debug, Error)]
pub enum Error {
    /// Input audio could not be read or decoded.
    #[error("failed to load audio: {0}")]
    Load(String),

    /// Decoded audio could not be brought into the canonical waveform shape.
    #[error("failed to preprocess audio: {0}")]
    Preprocess(String),

    /// A feature group could not produce its declared output.
    #[error("feature extraction failed in {group}: {message}")]
    Extraction {
        group: &'static str,
        message: String,
    },

    /// Model artifacts are missing or corrupt.
    #[error("model initialization failed: {0}")]
    Init(String),

    /// A prediction was requested before the ensemble became ready.
    #[error("detection system is not initialized: {0}")]
    NotInitialized(String),

    /// One classifier (or every classifier) failed to score a feature vector.
    #[error("prediction failed for {model}: {message}")]
    Prediction { model: String, message: String },

    /// The feature vector does not match the width the scaler and models were fit on.
    #[error("feature dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The request itself is unacceptable (size, extension, duration).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(Box<dyn StdError + Send + Sync>),
}

/// Machine-readable error category carried in failure responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Load,
    Preprocess,
    Extraction,
    Init,
    NotInitialized,
    Prediction,
    DimensionMismatch,
    InvalidInput,
    Internal,
}

impl Error {
    pub(crate) fn load(message: impl Into<String>) -> Self {
        Self::Load(message.into())
    }

    pub(crate) fn preprocess(message: impl Into<String>) -> Self {
        Self::Preprocess(message.into())
    }

    pub(crate) fn init(message: impl Into<String>) -> Self {
        Self::Init(message.into())
    }

    pub(crate) fn extraction(group: &'static str, message: impl Into<String>) -> Self {
        Self::Extraction {
            group,
            message: message.into(),
        }
    }

    pub(crate) fn prediction(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Prediction {
            model: model.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Load(_) => ErrorKind::Load,
            Self::Preprocess(_) => ErrorKind::Preprocess,
            Self::Extraction { .. } => ErrorKind::Extraction,
            Self::Init(_) => ErrorKind::Init,
            Self::NotInitialized(_) => ErrorKind::NotInitialized,
            Self::Prediction { .. } => ErrorKind::Prediction,
            Self::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Io(_) | Self::Json(_) | Self::Other(_) => ErrorKind::Internal,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_for_each_variant() {
        assert_eq!(Error::load("x").kind(), ErrorKind::Load);
        assert_eq!(Error::preprocess("x").kind(), ErrorKind::Preprocess);
        assert_eq!(Error::init("x").kind(), ErrorKind::Init);
        assert_eq!(
            Error::DimensionMismatch {
                expected: 154,
                actual: 3
            }
            .kind(),
            ErrorKind::DimensionMismatch
        );
        let io = std::io::Error::other("boom");
        assert_eq!(Error::from(io).kind(), ErrorKind::Internal);
    }

    #[test]
    fn kind_serializes_as_snake_case() -> anyhow::Result<()> {
        let s = serde_json::to_string(&ErrorKind::NotInitialized)?;
        assert_eq!(s, "\"not_initialized\"");
        Ok(())
    }

    #[test]
    fn extraction_message_names_the_group() {
        let err = Error::extraction("mfcc", "non-finite value");
        assert!(err.to_string().contains("mfcc"));
        assert!(err.to_string().contains("non-finite"));
    }
}
