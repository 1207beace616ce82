//! # tether-logging
//!
//! Structured logging for Tether built on `tracing`.
//!
//! - [`init_subscriber`] installs the process-wide subscriber (compact or JSON)
//! - [`LogLevel`] / [`LogFormat`] are the serde-friendly knobs read from settings
//! - [`capture_logs`] records events in memory for assertions in tests

#![deny(unsafe_code)]

pub mod capture;
pub mod types;

pub use capture::{CapturedEvent, CapturedLogs, capture_logs};
pub use types::{LogFormat, LogLevel};

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber writing to stderr.
///
/// `RUST_LOG` takes precedence over `level` when set. Calling this more than
/// once is harmless: later calls leave the first subscriber in place.
pub fn init_subscriber(level: LogLevel, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    // try_init fails only if a global subscriber already exists
    let _ = match format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
