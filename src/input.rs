//! Request-level checks run before any decoding work.

use std::path::Path;

use crate::opts::Opts;
use crate::{Error, Result};

/// Check an upload's size and file extension against `opts`.
///
/// Extensions compare case-insensitively; a name without an extension is rejected.
pub fn validate_upload(file_name: &str, size: u64, opts: &Opts) -> Result<()> {
    if size == 0 {
        return Err(Error::InvalidInput("file is empty".into()));
    }
    if size > opts.max_file_bytes {
        return Err(Error::InvalidInput(format!(
            "file size {size} bytes exceeds the {} MB limit",
            opts.max_file_bytes / (1024 * 1024)
        )));
    }

    let ext = extension_of(file_name)
        .ok_or_else(|| Error::InvalidInput(format!("'{file_name}' has no file extension")))?;
    if !opts
        .allowed_extensions
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(&ext))
    {
        return Err(Error::InvalidInput(format!(
            "unsupported format '.{ext}'; supported: {}",
            opts.allowed_extensions.join(", ")
        )));
    }
    Ok(())
}

/// Lower-cased extension of `file_name`, used both for validation and as a decoder hint.
pub fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(str::to_ascii_lowercase)
}

/// Reject decoded sources longer than `opts.max_input_seconds`.
pub(crate) fn check_source_duration(frames: u64, sample_rate: u32, opts: &Opts) -> Result<()> {
    if sample_rate == 0 || opts.max_input_seconds <= 0.0 {
        return Ok(());
    }
    let seconds = frames as f64 / sample_rate as f64;
    if seconds > opts.max_input_seconds as f64 {
        return Err(Error::InvalidInput(format!(
            "audio is {seconds:.1}s long; the limit is {:.0}s",
            opts.max_input_seconds
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_supported_extensions_in_any_case() -> anyhow::Result<()> {
        let opts = Opts::default();
        validate_upload("voice.WAV", 1024, &opts)?;
        validate_upload("clip.m4a", 1024, &opts)?;
        Ok(())
    }

    #[test]
    fn rejects_oversized_files() {
        let opts = Opts::default();
        let err = validate_upload("voice.wav", opts.max_file_bytes + 1, &opts).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(validate_upload("voice.wav", opts.max_file_bytes, &opts).is_ok());
    }

    #[test]
    fn rejects_unknown_or_missing_extensions() {
        let opts = Opts::default();
        assert!(validate_upload("notes.txt", 10, &opts).is_err());
        assert!(validate_upload("voice", 10, &opts).is_err());
    }

    #[test]
    fn source_duration_limit() {
        let opts = Opts::default();
        assert!(check_source_duration(22_050 * 300, 22_050, &opts).is_ok());
        assert!(check_source_duration(22_050 * 301, 22_050, &opts).is_err());
    }
}
