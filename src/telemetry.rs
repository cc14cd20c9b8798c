// ABOUTME: Tracing subscriber setup for binaries and tests that embed the colony.
// ABOUTME: RUST_LOG wins over the level passed in; output is compact and targetless.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Install a global compact `fmt` subscriber.
///
/// `level` is an `EnvFilter` directive such as `"info"` or
/// `"colony=debug"`, used when `RUST_LOG` is unset. Fails if the directive
/// is invalid or a global subscriber is already installed.
pub fn init(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}
