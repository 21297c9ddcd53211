//! Logging and observability
//!
//! Diagnostics are emitted through `tracing` and written to stderr, so stdout stays reserved
//! for stage output (see [`crate::output`]). The format is chosen at runtime from the CLI flag
//! or the `INFINITY_LOG_FORMAT` environment variable.

use anyhow::Result;
use std::{io, str::FromStr, sync::Once};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

static INIT: Once = Once::new();

/// Output format of diagnostic logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line, with a close event carrying the duration of each span
    Json,
}

impl FromStr for LogFormat {
    type Err = std::convert::Infallible;

    /// Anything but `json` falls back to text
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(if s.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Text
        })
    }
}

/// Initialize the logging system
///
/// Safe to call multiple times; only the first call installs a subscriber.
///
/// ## Arguments
///
/// * `format` - `None` defers to `INFINITY_LOG_FORMAT`, then text
/// * `default_directives` - filter used when neither `INFINITY_LOG` nor `RUST_LOG` is set
pub fn init(format: Option<&str>, default_directives: &str) -> Result<()> {
    INIT.call_once(|| {
        let env_format = std::env::var("INFINITY_LOG_FORMAT").ok();
        let format = format
            .or(env_format.as_deref())
            .and_then(|f| f.parse::<LogFormat>().ok())
            .unwrap_or_default();

        let filter = env_filter(
            std::env::var("INFINITY_LOG").ok().as_deref(),
            std::env::var("RUST_LOG").ok().as_deref(),
            default_directives,
        );

        let registry = tracing_subscriber::registry().with(filter);
        match format {
            LogFormat::Json => registry
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_events(FmtSpan::CLOSE)
                        .with_writer(io::stderr),
                )
                .init(),
            LogFormat::Text => registry
                .with(fmt::layer().with_target(false).with_writer(io::stderr))
                .init(),
        }

        tracing::debug!(?format, "Logging initialized");
    });

    Ok(())
}

/// Pick the first usable filter: `INFINITY_LOG`, `RUST_LOG`, then the caller's default
fn env_filter(infinity_log: Option<&str>, rust_log: Option<&str>, default: &str) -> EnvFilter {
    [("INFINITY_LOG", infinity_log), ("RUST_LOG", rust_log)]
        .into_iter()
        .find_map(|(name, directives)| {
            let directives = directives?;
            match EnvFilter::try_new(directives) {
                Ok(filter) => Some(filter),
                Err(err) => {
                    eprintln!("Ignoring invalid {} '{}': {}", name, directives, err);
                    None
                }
            }
        })
        .unwrap_or_else(|| {
            EnvFilter::try_new(default).unwrap_or_else(|_| EnvFilter::new("info"))
        })
}

/// Check if logging has been initialized
pub fn is_initialized() -> bool {
    INIT.is_completed()
}
