//! `clonewatch`: voice clone detection from recorded audio.
//!
//! This crate provides:
//! - Audio ingestion (any symphonia-supported container) and canonical preprocessing
//! - A fixed-layout, 154-value acoustic feature vector
//! - A multi-model ensemble over a shared standard scaler, with an explicit decision policy
//! - Result caching and health reporting around a single [`Detector`] entry point
//! - A trainer that fits the ensemble with the same feature extraction used at inference
//!
//! The library is used by the CLI, the trainer and the HTTP server alike; each binary is a
//! thin layer over [`Detector`] or [`train`].

// High-level API (most consumers should start here).
pub mod detector;
pub mod opts;
pub mod response;

// Errors.
mod error;

// Audio decoding and preprocessing.
pub mod audio_pipeline;
pub mod decoder;
pub mod input;
pub mod loader;
mod media;
pub mod waveform;
pub mod wav;

// Feature extraction.
pub mod features;

// Models, decisions and the state around them.
pub mod cache;
pub mod decision;
pub mod health;
pub mod model;

// Training and test signal generation.
pub mod synth;
pub mod train;

// Logging configuration.
#[cfg(feature = "logging")]
pub mod logging;

pub use detector::{Detector, DetectorStatus};
pub use error::{Error, ErrorKind, Result};
pub use features::{FEATURE_COUNT, FeatureVector, extract};
pub use opts::{Opts, ShortAudioPolicy, TieBreak};
pub use response::{AnalysisResponse, AnalysisResult};
pub use waveform::Waveform;

#[cfg(feature = "logging")]
pub use logging::init as init_logging;
