//! `tracing` subscriber setup shared by binaries and test harnesses.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{Error, Result};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Build the filter: `RUST_LOG` wins, otherwise `fallback` (e.g. `"info"` or
/// `"usemcp=debug,info"`).
pub fn build_filter(fallback: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(fallback).map_err(|source| Error::LogFilter {
            filter: fallback.to_string(),
            source,
        }),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(fallback_level: &str, format: LogFormat) -> Result<()> {
    let filter = build_filter(fallback_level)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .try_init(),
    };

    installed.map_err(|_| Error::SubscriberInstalled)
}
