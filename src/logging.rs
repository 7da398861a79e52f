//! Tracing infrastructure.
//!
//! Structured, async-aware logging for the sequencer. Uses `tracing` and
//! `tracing-subscriber` with environment-based filtering so a batch run can
//! be followed at `info` while hardware chatter stays at `debug`.
//!
//! Per-sample work is wrapped in spans carrying `sample`, `tube`, and
//! `needle` fields; every fatal error therefore logs with the fluidic
//! context it occurred in.

use crate::config::Settings;
use crate::error::{SolError, SolResult};
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

/// Parse a log level string from configuration.
fn parse_log_level(level: &str) -> SolResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(SolError::Configuration(format!(
            "invalid log level '{other}' (expected trace/debug/info/warn/error)"
        ))),
    }
}

/// Initialize the global subscriber from settings.
///
/// `RUST_LOG` takes precedence over the configured level when set. Safe to
/// call once per process; a second call returns an error from the subscriber
/// layer which is surfaced as a configuration error.
pub fn init_from_settings(settings: &Settings) -> SolResult<()> {
    let level = parse_log_level(&settings.log_level)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init()
        .map_err(|e| SolError::Configuration(format!("tracing init failed: {e}")))
}
