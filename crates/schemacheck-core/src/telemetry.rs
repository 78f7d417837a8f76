//! Tracing subscriber setup.
//!
//! `SCHEMACHECK_LOG` takes precedence over `RUST_LOG`; both fall back to
//! `info`. Installation is best-effort: if a global subscriber already
//! exists (another test, the embedding application) the call is a no-op.

use tracing::Span;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Environment variable holding filter directives.
pub const LOG_ENV: &str = "SCHEMACHECK_LOG";

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn build_env_filter() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_env(LOG_ENV) {
        return filter;
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Returns `false` when one was already set.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter = build_env_filter();
    let installed = match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };
    installed.is_ok()
}

/// Span wrapping one before/execute/after verification cycle.
pub fn cycle_span(run_id: &str, schema: &str) -> Span {
    tracing::info_span!("change_cycle", run_id = run_id, schema = schema)
}
