use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

/// What to do with a trimmed waveform shorter than [`Opts::min_duration_seconds`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum ShortAudioPolicy {
    /// Fail the request with a preprocess error.
    #[default]
    Reject,

    /// Append zeros until the floor is reached.
    ZeroPad,
}

/// Which label wins when the ensemble vote is split evenly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    #[default]
    Real,
    Fake,
}

/// Options that control how an analysis is performed.
///
/// This struct represents *library-level configuration*, not CLI flags directly.
/// The binaries map their flags (or a JSON config file) into this type so that:
/// - the library remains reusable outside of a CLI context
/// - tests can construct options programmatically
///
/// Every field has a default, so a config file only needs the keys it overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Opts {
    /// Frames quieter than this many dB below the loudest frame are trimmed from both ends.
    pub trim_top_db: f32,

    /// Minimum analysed duration after trimming.
    pub min_duration_seconds: f32,

    /// Analysis window cap; longer audio is truncated to this duration.
    pub max_duration_seconds: f32,

    /// Policy applied when the trimmed audio is shorter than `min_duration_seconds`.
    pub short_audio_policy: ShortAudioPolicy,

    /// Upper bound on the decoded source duration accepted for a request.
    pub max_input_seconds: f32,

    /// Upper bound on the encoded request size.
    pub max_file_bytes: u64,

    /// Lower-case file extensions accepted for analysis requests.
    pub allowed_extensions: Vec<String>,

    /// How long cached results and feature vectors stay valid.
    pub cache_ttl_seconds: u64,

    /// Maximum number of cached results kept before the oldest entries are evicted.
    pub cache_capacity: usize,

    /// Even-split resolution for the ensemble vote.
    pub tie_break: TieBreak,

    /// Fallback order used when the configured best model has no prediction.
    ///
    /// When empty, the metadata's `model_priority` (or the built-in list) is used.
    pub model_priority: Vec<String>,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            trim_top_db: 20.0,
            min_duration_seconds: 0.5,
            max_duration_seconds: 30.0,
            short_audio_policy: ShortAudioPolicy::Reject,
            max_input_seconds: 300.0,
            max_file_bytes: 50 * 1024 * 1024,
            allowed_extensions: ["wav", "mp3", "m4a", "flac", "ogg", "aac"]
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
            cache_ttl_seconds: 3600,
            cache_capacity: 1024,
            tie_break: TieBreak::Real,
            model_priority: Vec::new(),
        }
    }
}

impl Opts {
    /// Longest cache TTL accepted: one year.
    pub const MAX_CACHE_TTL_SECONDS: u64 = 365 * 24 * 60 * 60;

    /// Load options from a JSON file, filling unspecified keys with defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let opts: Self = serde_json::from_slice(&bytes)?;
        opts.validate()?;
        Ok(opts)
    }

    /// Reject values the pipeline cannot honour.
    ///
    /// Durations must be finite and non-negative with the floor no larger than the cap, and
    /// the cache TTL may not exceed [`Opts::MAX_CACHE_TTL_SECONDS`].
    pub fn validate(&self) -> Result<()> {
        let invalid =
            |msg: String| -> Result<()> { Err(Error::InvalidInput(format!("invalid options: {msg}"))) };

        for (name, value) in [
            ("trim_top_db", self.trim_top_db),
            ("min_duration_seconds", self.min_duration_seconds),
            ("max_duration_seconds", self.max_duration_seconds),
            ("max_input_seconds", self.max_input_seconds),
        ] {
            if !value.is_finite() || value < 0.0 {
                return invalid(format!("{name} must be finite and non-negative, got {value}"));
            }
        }
        if self.max_duration_seconds <= 0.0 {
            return invalid("max_duration_seconds must be positive".into());
        }
        if self.min_duration_seconds > self.max_duration_seconds {
            return invalid(format!(
                "min_duration_seconds ({}) exceeds max_duration_seconds ({})",
                self.min_duration_seconds, self.max_duration_seconds
            ));
        }
        if self.cache_ttl_seconds > Self::MAX_CACHE_TTL_SECONDS {
            return invalid(format!(
                "cache_ttl_seconds ({}) exceeds {}",
                self.cache_ttl_seconds,
                Self::MAX_CACHE_TTL_SECONDS
            ));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}
