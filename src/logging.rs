//! Process-wide `tracing` subscriber for the binaries.
//!
//! - `CLONEWATCH_LOG` takes an `EnvFilter` directive (e.g. `clonewatch=debug,tower_http=info`);
//!   the default is `warn`.
//! - `CLONEWATCH_LOG_FORMAT=text` switches from JSON lines to human-readable output.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const FILTER_ENV: &str = "CLONEWATCH_LOG";
const FORMAT_ENV: &str = "CLONEWATCH_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Text,
}

impl Format {
    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("text") || v.eq_ignore_ascii_case("pretty") => {
                Self::Text
            }
            _ => Self::Json,
        }
    }
}

/// Install the global subscriber. Later calls (and calls after another subscriber was set)
/// are ignored.
pub fn init() {
    let filter = EnvFilter::builder()
        .with_env_var(FILTER_ENV)
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    let format = Format::parse(std::env::var(FORMAT_ENV).ok().as_deref());
    let registry = tracing_subscriber::registry().with(filter);
    let _ = match format {
        Format::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init(),
        Format::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_defaults_to_json() {
        assert_eq!(Format::parse(None), Format::Json);
        assert_eq!(Format::parse(Some("bogus")), Format::Json);
        assert_eq!(Format::parse(Some(" Text ")), Format::Text);
    }

    #[test]
    fn init_can_run_twice() {
        init();
        init();
    }
}
