//! Structured logging setup
//!
//! JSON lines on stdout through `tracing-subscriber`. `RUST_LOG` wins when
//! set; otherwise the filter comes from the `--verbosity` flag.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The filter directive could not be parsed
    #[error("invalid log filter: {0}")]
    Filter(String),

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Map a klog-style verbosity to a default filter directive
///
/// 0-4 is info, 5-8 is debug and 9 or more is trace. Dependency noise stays
/// at warn regardless.
pub fn default_directive(verbosity: u8) -> String {
    let level = match verbosity {
        0..=4 => "info",
        5..=8 => "debug",
        _ => "trace",
    };
    format!("{level},replica_gate={level},kube=info,tower=warn,hyper=warn,rustls=warn")
}

/// Install the global JSON subscriber
pub fn init_telemetry(verbosity: u8) -> Result<(), TelemetryError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directive(verbosity))
            .map_err(|e| TelemetryError::Filter(e.to_string()))?,
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}
