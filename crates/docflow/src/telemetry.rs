//! Logging setup.
//!
//! Library code logs through `log` macros and opens `tracing` spans around
//! units of work. The binary calls [`init`] once; `tracing_log::LogTracer`
//! forwards `log` records into the tracing subscriber so they carry the
//! enclosing span.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Noisy dependencies held at `warn` unless overridden by `RUST_LOG`.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "h2", "tower_http"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "json" | "jsonl" => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("A global subscriber is already installed: {0}")]
    AlreadyInstalled(String),
}

/// Builds the filter from `RUST_LOG` if set, else from `default_level`
/// plus the quiet-target directives.
pub fn build_env_filter(default_level: &str) -> Result<EnvFilter, TelemetryError> {
    if let Ok(from_env) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(&from_env).map_err(|e| TelemetryError::InvalidFilter {
            filter: from_env,
            reason: e.to_string(),
        });
    }

    let mut directives = vec![default_level.to_string()];
    directives.extend(QUIET_TARGETS.iter().map(|t| format!("{}=warn", t)));
    let filter = directives.join(",");
    EnvFilter::try_new(&filter).map_err(|e| TelemetryError::InvalidFilter {
        filter,
        reason: e.to_string(),
    })
}

/// Installs the global subscriber.
pub fn init(default_level: &str, format: LogFormat) -> Result<(), TelemetryError> {
    tracing_log::LogTracer::init().ok();

    let layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_names(true)
            .with_span_list(true)
            .with_filter(build_env_filter(default_level)?)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(build_env_filter(default_level)?)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInstalled(e.to_string()))?;

    tracing::debug!("Logging initialized: level={}, format={:?}", default_level, format);
    Ok(())
}
