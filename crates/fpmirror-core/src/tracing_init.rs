//! Process-wide `tracing` setup for embedders.
//!
//! The protocol core only ever talks to a [`LogSink`](crate::LogSink); the
//! embedding layer decides where those lines end up. When it wants them on
//! stderr through `tracing`, it calls [`init_tracing`] once at startup.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Install the global subscriber, writing to stderr.
///
/// `RUST_LOG` wins over `default_filter` (e.g. `"fpmirror=info"`). With
/// `log_json` every event is one JSON object per line.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_tracing(default_filter: &str, log_json: bool) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let json = log_json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text = (!log_json).then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .try_init()
        .is_ok()
}

/// Initialise tracing from the `logging` section of a loaded [`Config`](crate::Config).
pub fn init_from_config(logging: &LoggingConfig) -> bool {
    init_tracing(&logging.filter, logging.json)
}
