//! Global `tracing` logger configuration for tollgate services.
//!
//! Two env vars drive the logger:
//!
//! - `RUST_LOG`: a `tracing_subscriber` targets filter; defaults to INFO.
//! - `LOG_FORMAT`: `"compact"` (human-readable, colored when stdout is a
//!   terminal; the dev default) or `"json"` (one JSON object per line,
//!   for the log aggregator in front of production replicas).
//!
//! Both are read here rather than through the service `Config`, since the
//! logger must be installed before configuration parsing so config errors
//! are themselves logged.

use std::{
    io::IsTerminal,
    str::FromStr,
};

use anyhow::anyhow;
use tracing::Level;
use tracing_subscriber::{
    filter::Targets,
    layer::{Layer, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
};

use crate::env;

/// The output format for log lines.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl LogFormat {
    /// Reads `LOG_FORMAT`, falling back to [`LogFormat::Compact`] when
    /// unset. An unparseable value also falls back (the logger isn't up
    /// yet, so there is nowhere better to complain than stderr).
    fn from_env() -> Self {
        match env::opt_var("LOG_FORMAT") {
            None => Self::default(),
            Some(value) => value.parse().unwrap_or_else(|err| {
                eprintln!("{err:#}; falling back to compact logs");
                Self::default()
            }),
        }
    }
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(anyhow!(
                "Unrecognized LOG_FORMAT '{other}': \
                 must be 'compact' or 'json'"
            )),
        }
    }
}

/// Initialize the global `tracing` logger from `RUST_LOG` + `LOG_FORMAT`.
///
/// Panics if a logger is already initialized, so call it exactly once,
/// first thing in `main`.
pub fn init() {
    try_init(LogFormat::from_env()).expect("Failed to set up logger");
}

/// Use this to initialize the global logger in tests. Never panics:
/// multiple test threads will race to set the global logger and all but
/// one will lose.
pub fn init_for_testing() {
    let _ = try_init(LogFormat::Compact);
}

/// Try to initialize a global logger with an explicit format. Returns an
/// `Err` if another global logger is already set.
pub fn try_init(format: LogFormat) -> Result<(), TryInitError> {
    // Defaults to INFO if no `RUST_LOG` env var is set or the targets
    // filter doesn't parse.
    let rust_log_filter = env::opt_var("RUST_LOG")
        .and_then(|rust_log| Targets::from_str(&rust_log).ok())
        .unwrap_or_else(|| Targets::new().with_default(Level::INFO));

    let registry = tracing_subscriber::registry();
    match format {
        LogFormat::Compact => {
            let stdout_log = tracing_subscriber::fmt::layer()
                .compact()
                // Colors would just be escape noise in a pipe.
                .with_ansi(std::io::stdout().is_terminal())
                .with_filter(rust_log_filter);
            registry.with(stdout_log).try_init()
        }
        LogFormat::Json => {
            let stdout_log = tracing_subscriber::fmt::layer()
                .json()
                // Lift event fields to top-level keys so the aggregator
                // can index them without unnesting.
                .flatten_event(true)
                .with_current_span(true)
                .with_ansi(false)
                .with_filter(rust_log_filter);
            registry.with(stdout_log).try_init()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn log_format_parsing() {
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("yaml".parse::<LogFormat>().is_err());
        assert!("JSON".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::default(), LogFormat::Compact);
    }
}
