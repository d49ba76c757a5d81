//! Logging setup and span constructors shared by Podium components.
//!
//! Workers, the pipeline and the semaphore all log through `tracing`. Binaries
//! call [`init_logging`] once at startup; libraries only create spans.

use std::fmt;
use std::str::FromStr;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt as fmt_layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::Error;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(Error::InvalidInput(format!("unknown log format: {other}"))),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        })
    }
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; only the first call installs a subscriber, and
/// a subscriber installed elsewhere is left in place.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `podium_flow=debug`)
///
/// # Example
///
/// ```rust
/// use podium_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Json);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let installed = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer::layer().pretty())
                .try_init(),
        };
        if installed.is_err() {
            tracing::debug!("global subscriber already installed");
        }
    });
}

/// Creates a span covering one pipeline run over a batch of input events.
///
/// # Example
///
/// ```rust
/// use podium_core::observability::pipeline_span;
///
/// let span = pipeline_span("01J0000000000000000000000", 12);
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn pipeline_span(batch_id: &str, events: usize) -> Span {
    tracing::info_span!("pipeline", batch_id = batch_id, events = events)
}

/// Creates a span covering one worker invocation.
#[must_use]
pub fn worker_span(worker_id: &str, group_key: &str) -> Span {
    tracing::info_span!("worker", worker_id = worker_id, group = group_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn test_log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_spans_enter() {
        let span = pipeline_span("batch-1", 3);
        let _guard = span.enter();
        let inner = worker_span("worker-1", "score-writers");
        let _inner = inner.enter();
        tracing::info!("inside worker span");
    }
}
