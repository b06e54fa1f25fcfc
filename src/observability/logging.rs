//! # Logging
//!
//! Global `tracing` subscriber setup. `RUST_LOG` wins over the configured level
//! when set, so per-module filters stay available in the field.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// `format` is `json` (default for deployments) or `text`.
pub fn init_tracing(level: &str, format: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("operator_engine={}", level.to_lowercase())));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = if format.eq_ignore_ascii_case("text") {
        builder.try_init()
    } else {
        builder.json().flatten_event(true).try_init()
    };
    result.map_err(|e| anyhow!("Failed to install tracing subscriber: {e}"))
}
