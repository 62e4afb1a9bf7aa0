//! Logging bootstrap
//!
//! Installs a `tracing-subscriber` formatter. `RUST_LOG` takes precedence over
//! the configured level.

use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;

impl LogLevel {
    /// Filter directive for this level
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Initialize the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
